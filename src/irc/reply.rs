//! Outbound wire encoding and protocol validation.
//!
//! Every server-generated line is produced here. The formats are part of
//! the wire contract and the tests match them byte for byte. A reply may
//! render to more than one line (NAMES is a 353/366 pair, LIST is a
//! header, one 322 per entry, and a terminator).

use std::sync::LazyLock;

use regex::Regex;

static NICK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z\[\]_^{|}][A-Za-z0-9\[\]_^{|}]*$").expect("nick regex")
});

static CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[a-z0-9_\-]+$").expect("channel regex"));

/// Whether `nick` is an acceptable nickname.
pub fn valid_nick(nick: &str) -> bool {
    NICK_RE.is_match(nick)
}

/// Whether `name` is an acceptable channel name. Case-sensitive: channel
/// names are created in lowercase only.
pub fn valid_channel(name: &str) -> bool {
    CHANNEL_RE.is_match(name)
}

/// A semantic reply, one variant per wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// 001, sent on registration.
    Welcome,
    /// `JOIN` as seen by channel members.
    Join { nick: String, channel: String },
    /// `PART` as seen by channel members.
    Part { nick: String, channel: String },
    /// 332, the channel topic.
    Topic { channel: String, topic: String },
    /// 331, no topic set.
    NoTopic { channel: String },
    /// 353/366 pair; `nicks` is the pre-joined member list.
    Names { channel: String, nicks: String },
    /// `NICK` as seen by everyone sharing a channel with the subject.
    NickChange { old: String, new: String },
    /// `PRIVMSG` forwarded to a channel member or a direct target.
    Msg {
        from: String,
        target: String,
        text: String,
    },
    /// 321/322/323 channel listing.
    List { entries: Vec<String> },
    /// 324, channel mode query answer.
    ChannelModeIs { channel: String, modes: String },
    /// 381, operator grant.
    Oper,
    /// `KILL`, forced removal.
    Kill { reason: String },
    /// 461, not enough parameters.
    MoreArgs,
    /// 431, no nickname given.
    NoNick,
    /// 432, malformed nickname.
    InvalidNick { nick: String },
    /// 433, nickname taken.
    NickInUse { nick: String },
    /// 462, registration sequence violation.
    AlreadyReg,
    /// 401, unknown message target.
    NoSuchNick { target: String },
    /// 421, unrecognized verb.
    UnknownCommand { command: String },
    /// 451, command requires registration.
    NotReg,
    /// 464, bad password.
    Password,
    /// 481, missing privileges.
    NoPriv,
}

impl Reply {
    /// Render to wire lines, without the `\r\n` terminator. `server` is
    /// the server identity and `nick` the recipient's current nick; they
    /// fill the `:<server>` prefix and recipient slots where the format
    /// has them.
    pub fn lines(&self, server: &str, nick: &str) -> Vec<String> {
        match self {
            Reply::Welcome => {
                vec![format!(":{server} 001 {nick} :Welcome to {server}")]
            }
            Reply::Join { nick: subject, channel } => {
                vec![format!(":{subject} JOIN {channel}")]
            }
            Reply::Part { nick: subject, channel } => {
                vec![format!(":{subject} PART {channel}")]
            }
            Reply::Topic { channel, topic } => {
                vec![format!(":{server} 332 {nick} {channel} :{topic}")]
            }
            Reply::NoTopic { channel } => {
                vec![format!(":{server} 331 {nick} {channel} :No topic is set")]
            }
            Reply::Names { channel, nicks } => vec![
                format!(":{server} 353 {nick} = {channel} :{nicks}"),
                format!(":{server} 366 {nick}"),
            ],
            Reply::NickChange { old, new } => {
                vec![format!(":{old} NICK {new}")]
            }
            Reply::Msg { from, target, text } => {
                vec![format!(":{from} PRIVMSG {target} {text}")]
            }
            Reply::List { entries } => {
                let mut lines = Vec::with_capacity(entries.len() + 2);
                lines.push(format!(":{server} 321 {nick}"));
                for entry in entries {
                    lines.push(format!(":{server} 322 {nick} {entry}"));
                }
                lines.push(format!(":{server} 323 {nick}"));
                lines
            }
            Reply::ChannelModeIs { channel, modes } => {
                vec![format!(":{server} 324 {nick} {channel} {modes}")]
            }
            Reply::Oper => {
                vec![format!(":{server} 381 {nick} :You are now an operator")]
            }
            Reply::Kill { reason } => {
                vec![format!(":{server} KILL {nick} A {reason}")]
            }
            Reply::MoreArgs => {
                vec![format!(":{server} 461 {nick} :Not enough params")]
            }
            Reply::NoNick => {
                vec![format!(":{server} 431 {nick} :No nickname given")]
            }
            Reply::InvalidNick { nick: given } => {
                vec![format!(":{server} 432 {nick} {given} :Erronenous nickname")]
            }
            Reply::NickInUse { nick: given } => {
                vec![format!(":{server} 433 {nick} {given} :Nick already in use")]
            }
            Reply::AlreadyReg => {
                vec![format!(":{server} 462 :You need a valid nick first")]
            }
            Reply::NoSuchNick { target } => {
                vec![format!(":{server} 401 {nick} {target} :No such nick/channel")]
            }
            Reply::UnknownCommand { command } => {
                vec![format!(":{server} 421 {nick} {command} :Unknown command")]
            }
            Reply::NotReg => {
                vec![format!(":{server} 451 :You have not registered")]
            }
            Reply::Password => {
                vec![format!(":{server} 464 {nick} :Error, password incorrect")]
            }
            Reply::NoPriv => {
                vec![format!(":{server} 481 {nick} :Permission denied")]
            }
        }
    }
}
