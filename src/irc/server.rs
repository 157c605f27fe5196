//! The state graph, the single-writer dispatcher, and command handlers.
//!
//! One dispatcher task owns every piece of shared state: the nick table,
//! the channel table, and each client's nick and membership set. It is
//! the sole consumer of the event queue, so events are applied atomically
//! in arrival order and no handler ever takes a lock. Connections are
//! referenced by [`ClientId`]; channels and members are keyed by their
//! folded (ASCII-lowercased) names.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::connection::{ConnHandle, Session};
use super::message::{self, Message};
use super::reply::{self, Reply};
use crate::config::Config;

/// Capacity of the shared event queue. Producers await their send, so a
/// full queue applies backpressure to readers rather than dropping input.
const EVENT_QUEUE_LEN: usize = 1024;

/// Stable identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ClientId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work for the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// An accepted connection enters the client table.
    Attach { id: ClientId, client: Client },
    /// One raw line, without its CRLF, read from a connection.
    Input { id: ClientId, line: String },
    /// A session exited: part everywhere, unbind the nick, drop the
    /// client entry.
    Hangup(ClientId),
}

/// Per-channel member flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMode {
    pub operator: bool,
    pub voice: bool,
}

impl ClientMode {
    /// NAMES prefix: `@` for operators, `+` for voiced members.
    pub fn prefix(self) -> &'static str {
        if self.operator {
            "@"
        } else if self.voice {
            "+"
        } else {
            ""
        }
    }
}

/// A channel and its members. Member and mode maps are keyed by folded
/// nick; the mode map carries an entry per member.
#[derive(Debug, Default)]
pub struct Channel {
    name: String,
    topic: String,
    members: HashMap<String, ClientId>,
    modes: HashMap<String, ClientMode>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Channel {
            name: name.to_owned(),
            ..Channel::default()
        }
    }
}

/// Dispatcher-side record of one connection: the display nick (empty
/// until the first successful NICK), the folded names of joined channels,
/// and the handles for reaching the session.
#[derive(Debug)]
pub struct Client {
    nick: String,
    channels: HashSet<String>,
    outgoing: mpsc::Sender<String>,
    handle: ConnHandle,
}

impl Client {
    pub fn new(outgoing: mpsc::Sender<String>, handle: ConnHandle) -> Self {
        Client {
            nick: String::new(),
            channels: HashSet::new(),
            outgoing,
            handle,
        }
    }

    /// Offer a rendered reply to the session's output queue.
    ///
    /// No-op once the connection is marked down. A full queue drops the
    /// line and disconnects the client rather than ever blocking the
    /// dispatcher.
    fn reply(&self, server: &str, reply: &Reply) {
        if !self.handle.is_connected() {
            return;
        }
        for line in reply.lines(server, &self.nick) {
            match self.outgoing.try_send(line) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(nick = %self.nick, "output queue full, dropping client");
                    self.handle.disconnect();
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

/// Folded form used for every map key derived from user input.
fn fold(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// The shared state graph. Owned exclusively by the dispatcher task;
/// nothing in here is behind a lock.
pub struct Server {
    name: String,
    clients: HashMap<ClientId, Client>,
    /// Folded nick to connection, one entry per registered client.
    nicks: HashMap<String, ClientId>,
    /// Folded channel name to channel. Channels live from first JOIN to
    /// the PART or hangup that empties them.
    channels: HashMap<String, Channel>,
}

impl Server {
    pub fn new(name: impl Into<String>) -> Self {
        Server {
            name: name.into(),
            clients: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Apply one event. All mutations and reply offers triggered by the
    /// event complete before this returns, which makes the event queue
    /// the linearization point for every observable state change.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Attach { id, client } => {
                self.clients.insert(id, client);
            }
            Event::Input { id, line } => {
                let Ok(msg) = Message::parse(&line) else { return };
                if self.clients.contains_key(&id) {
                    self.dispatch(id, msg);
                }
            }
            Event::Hangup(id) => self.drop_client(id),
        }
    }

    fn dispatch(&mut self, id: ClientId, msg: Message) {
        let registered = !self.clients[&id].nick.is_empty();
        if !registered && !matches!(msg.command.as_str(), "NICK" | "USER" | "QUIT") {
            self.reply(id, &Reply::NotReg);
            return;
        }

        match msg.command.as_str() {
            "NICK" => self.handle_nick(id, &msg.args),
            "USER" => self.handle_user(id),
            "JOIN" => self.handle_join(id, &msg.args),
            "PART" => self.handle_part(id, &msg.args),
            "PRIVMSG" => self.handle_privmsg(id, &msg.args),
            "TOPIC" => self.handle_topic(id, &msg.args),
            "MODE" => self.handle_mode(id, &msg.args),
            "QUIT" => self.handle_quit(id),
            other => self.reply(
                id,
                &Reply::UnknownCommand {
                    command: other.to_owned(),
                },
            ),
        }
    }

    fn reply(&self, id: ClientId, reply: &Reply) {
        if let Some(client) = self.clients.get(&id) {
            client.reply(&self.name, reply);
        }
    }

    // ── NICK / USER ──────────────────────────────────────────────

    fn handle_nick(&mut self, id: ClientId, args: &[String]) {
        let Some(new_nick) = args.first() else {
            self.reply(id, &Reply::NoNick);
            return;
        };
        if !reply::valid_nick(new_nick) {
            self.reply(id, &Reply::InvalidNick { nick: new_nick.clone() });
            return;
        }
        if self.nicks.contains_key(&fold(new_nick)) {
            self.reply(id, &Reply::NickInUse { nick: new_nick.clone() });
            return;
        }
        self.set_nick(id, new_nick.clone());
    }

    /// Rebind a client under a new nick, preserving its channel modes,
    /// and tell everyone who shares a channel with it (the subject
    /// included) exactly once.
    fn set_nick(&mut self, id: ClientId, new_nick: String) {
        let Some(client) = self.clients.get_mut(&id) else { return };
        let old_nick = std::mem::replace(&mut client.nick, new_nick.clone());
        let joined: Vec<String> = client.channels.iter().cloned().collect();

        let old_key = fold(&old_nick);
        let new_key = fold(&new_nick);
        if !old_nick.is_empty() {
            self.nicks.remove(&old_key);
        }
        self.nicks.insert(new_key.clone(), id);

        let mut audience: HashSet<String> = HashSet::new();
        for channel_key in &joined {
            let Some(channel) = self.channels.get_mut(channel_key) else { continue };
            if channel.members.remove(&old_key).is_some() {
                channel.members.insert(new_key.clone(), id);
                let mode = channel.modes.remove(&old_key).unwrap_or_default();
                channel.modes.insert(new_key.clone(), mode);
            }
            audience.extend(channel.members.keys().cloned());
        }

        let mut audience: Vec<String> = audience.into_iter().collect();
        audience.sort();
        let notice = Reply::NickChange {
            old: old_nick,
            new: new_nick,
        };
        for nick_key in audience {
            if let Some(&peer) = self.nicks.get(&nick_key) {
                self.reply(peer, &notice);
            }
        }
    }

    fn handle_user(&mut self, id: ClientId) {
        if self.clients[&id].nick.is_empty() {
            // No NICK yet: install a unique Guest nick so the welcome
            // has someone to address.
            let mut guest = format!("Guest{}", rand::random::<u32>());
            while self.nicks.contains_key(&fold(&guest)) {
                guest = format!("Guest{}", rand::random::<u32>());
            }
            self.set_nick(id, guest);
        }
        self.reply(id, &Reply::Welcome);
    }

    // ── JOIN / PART ──────────────────────────────────────────────

    fn handle_join(&mut self, id: ClientId, args: &[String]) {
        let Some(targets) = args.first() else {
            self.reply(id, &Reply::MoreArgs);
            return;
        };

        if targets == "0" {
            let joined: Vec<String> = self.clients[&id].channels.iter().cloned().collect();
            for name in joined {
                self.part_channel(id, &name);
            }
            return;
        }

        for target in targets.split(',') {
            if reply::valid_channel(target) {
                self.join_channel(id, target);
            }
        }
    }

    /// Put a client into a channel, creating it on demand. The creator
    /// becomes operator. Joining a channel twice is a no-op.
    fn join_channel(&mut self, id: ClientId, name: &str) {
        let Some(client) = self.clients.get(&id) else { return };
        let nick_key = fold(&client.nick);
        let key = fold(name);

        let created = !self.channels.contains_key(&key);
        let channel = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| Channel::new(name));
        if channel.members.contains_key(&nick_key) {
            return;
        }
        channel.members.insert(nick_key.clone(), id);
        channel.modes.insert(
            nick_key,
            ClientMode {
                operator: created,
                voice: false,
            },
        );

        if let Some(client) = self.clients.get_mut(&id) {
            client.channels.insert(key.clone());
        }

        let Some(channel) = self.channels.get(&key) else { return };
        let announce = Reply::Join {
            nick: self.clients[&id].nick.clone(),
            channel: channel.name.clone(),
        };
        for &member in channel.members.values() {
            self.reply(member, &announce);
        }

        if channel.topic.is_empty() {
            self.reply(id, &Reply::NoTopic { channel: channel.name.clone() });
        } else {
            self.reply(
                id,
                &Reply::Topic {
                    channel: channel.name.clone(),
                    topic: channel.topic.clone(),
                },
            );
        }

        self.reply(
            id,
            &Reply::Names {
                channel: channel.name.clone(),
                nicks: self.names_of(channel),
            },
        );
    }

    /// Space-joined NAMES entries, each the member's mode prefix plus its
    /// display nick, sorted so the listing is deterministic.
    fn names_of(&self, channel: &Channel) -> String {
        let mut entries: Vec<String> = channel
            .members
            .iter()
            .filter_map(|(key, id)| {
                let client = self.clients.get(id)?;
                let mode = channel.modes.get(key).copied().unwrap_or_default();
                Some(format!("{}{}", mode.prefix(), client.nick))
            })
            .collect();
        entries.sort();
        entries.join(" ")
    }

    fn handle_part(&mut self, id: ClientId, args: &[String]) {
        let Some(targets) = args.first() else {
            self.reply(id, &Reply::MoreArgs);
            return;
        };
        for target in targets.split(',') {
            if reply::valid_channel(target) {
                self.part_channel(id, target);
            }
        }
    }

    /// Remove a client from a channel, notifying every current member
    /// (the leaver included). Unknown channels and non-membership are
    /// no-ops. Reclaims the channel when its last member leaves.
    fn part_channel(&mut self, id: ClientId, name: &str) {
        let key = fold(name);
        let Some(client) = self.clients.get(&id) else { return };
        let nick_key = fold(&client.nick);

        let Some(channel) = self.channels.get(&key) else { return };
        if !channel.members.contains_key(&nick_key) {
            return;
        }

        let announce = Reply::Part {
            nick: client.nick.clone(),
            channel: channel.name.clone(),
        };
        for &member in channel.members.values() {
            self.reply(member, &announce);
        }

        let now_empty = match self.channels.get_mut(&key) {
            Some(channel) => {
                channel.members.remove(&nick_key);
                channel.modes.remove(&nick_key);
                channel.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.channels.remove(&key);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.channels.remove(&key);
        }
    }

    // ── PRIVMSG / TOPIC / MODE ───────────────────────────────────

    fn handle_privmsg(&mut self, id: ClientId, args: &[String]) {
        if args.len() < 2 {
            self.reply(id, &Reply::MoreArgs);
            return;
        }
        let target = &args[0];
        let text = message::trailing(&args[1..]);
        let from = self.clients[&id].nick.clone();
        let key = fold(target);

        if let Some(channel) = self.channels.get(&key) {
            let forward = Reply::Msg {
                from,
                target: target.clone(),
                text,
            };
            for &member in channel.members.values() {
                if member != id {
                    self.reply(member, &forward);
                }
            }
        } else if let Some(&peer) = self.nicks.get(&key) {
            let forward = Reply::Msg {
                from,
                target: self.clients[&peer].nick.clone(),
                text,
            };
            self.reply(peer, &forward);
        } else {
            self.reply(id, &Reply::NoSuchNick { target: target.clone() });
        }
    }

    fn handle_topic(&mut self, id: ClientId, args: &[String]) {
        let Some(target) = args.first() else {
            self.reply(id, &Reply::MoreArgs);
            return;
        };
        let key = fold(target);
        let Some(channel) = self.channels.get(&key) else {
            self.reply(id, &Reply::NoSuchNick { target: target.clone() });
            return;
        };

        if args.len() == 1 {
            self.reply(
                id,
                &Reply::Topic {
                    channel: channel.name.clone(),
                    topic: channel.topic.clone(),
                },
            );
            return;
        }

        let name = channel.name.clone();
        let members: Vec<ClientId> = channel.members.values().copied().collect();

        if args[1] == ":" {
            if let Some(channel) = self.channels.get_mut(&key) {
                channel.topic.clear();
            }
            let notice = Reply::NoTopic { channel: name };
            for member in members {
                self.reply(member, &notice);
            }
        } else {
            let topic = message::trailing(&args[1..]);
            if let Some(channel) = self.channels.get_mut(&key) {
                channel.topic = topic.clone();
            }
            let notice = Reply::Topic { channel: name, topic };
            for member in members {
                self.reply(member, &notice);
            }
        }
    }

    /// Channel-mode query. No channel-level modes exist in the data
    /// model, so the answer is always the bare `+`.
    fn handle_mode(&mut self, id: ClientId, args: &[String]) {
        let Some(target) = args.first() else {
            self.reply(id, &Reply::MoreArgs);
            return;
        };
        match self.channels.get(&fold(target)) {
            Some(channel) => {
                let answer = Reply::ChannelModeIs {
                    channel: channel.name.clone(),
                    modes: "+".to_owned(),
                };
                self.reply(id, &answer);
            }
            None => self.reply(id, &Reply::NoSuchNick { target: target.clone() }),
        }
    }

    // ── QUIT / teardown ──────────────────────────────────────────

    fn handle_quit(&mut self, id: ClientId) {
        if let Some(client) = self.clients.get(&id) {
            client.handle.disconnect();
        }
    }

    /// Session teardown: part every joined channel (members are
    /// notified; the leaver's own offers are gated off by its cleared
    /// connected flag), then unbind the nick and drop the client.
    fn drop_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.get(&id) else { return };
        let joined: Vec<String> = client.channels.iter().cloned().collect();
        for name in joined {
            self.part_channel(id, &name);
        }

        if let Some(client) = self.clients.remove(&id) {
            let nick_key = fold(&client.nick);
            if !client.nick.is_empty() && self.nicks.get(&nick_key) == Some(&id) {
                self.nicks.remove(&nick_key);
            }
            info!(%id, nick = %client.nick, "client removed");
        }
    }
}

// ── Listener / wiring ────────────────────────────────────────────

/// Run the server: spawn the dispatcher, bind, and accept forever.
pub async fn run(config: Config) -> io::Result<()> {
    let (events, inbox) = mpsc::channel(EVENT_QUEUE_LEN);
    spawn_dispatcher(Server::new(&config.server_name), inbox);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, name = %config.server_name, "rosella listening");
    accept_loop(listener, events).await
}

/// Bind and serve in a background task, returning the bound address.
/// Lets tests listen on port 0.
pub async fn start(config: Config) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    let (events, inbox) = mpsc::channel(EVENT_QUEUE_LEN);
    spawn_dispatcher(Server::new(&config.server_name), inbox);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, name = %config.server_name, "rosella listening");
    Ok((addr, tokio::spawn(accept_loop(listener, events))))
}

fn spawn_dispatcher(mut server: Server, mut inbox: mpsc::Receiver<Event>) {
    tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            server.handle_event(event);
        }
    });
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) -> io::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        // Spawned so that a backed-up event queue stalls only this
        // connection's attach, never the accept loop itself.
        tokio::spawn(handle_connection(socket, events.clone()));
    }
}

/// Register an accepted socket: allocate its id, enter it into the
/// client table, then start its session. The attach event is enqueued
/// before any I/O task runs, so input cannot outrun registration.
pub async fn handle_connection(socket: TcpStream, events: mpsc::Sender<Event>) {
    let id = ClientId::next();
    let (session, handle, outgoing) = Session::new(id, socket, events.clone());
    let client = Client::new(outgoing, handle);
    if events.send(Event::Attach { id, client }).await.is_err() {
        warn!(%id, "event queue closed during attach");
        return;
    }
    session.spawn();
}
