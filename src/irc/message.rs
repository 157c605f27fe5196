//! Inbound IRC line parsing.
//!
//! A line is split on ASCII whitespace. An optional leading `:source`
//! token is dropped (this server never acts on client-supplied prefixes),
//! the next token is the command, uppercased, and the rest are arguments.
//! Reassembly of trailing `:free text` arguments is left to the commands
//! that accept them, via [`trailing`].

use thiserror::Error;

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The command verb, uppercased.
    pub command: String,
    /// Whitespace-separated arguments, in order.
    pub args: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
}

impl Message {
    /// Parse a single line (without its `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut fields = input.split_ascii_whitespace();

        let mut command = fields.next().ok_or(ParseError::Empty)?;
        if command.starts_with(':') {
            command = fields.next().ok_or(ParseError::Empty)?;
        }

        Ok(Message {
            command: command.to_ascii_uppercase(),
            args: fields.map(str::to_owned).collect(),
        })
    }
}

/// Join argument tokens back into trailing free text: tokens separated by
/// a single space, with the leading `:` stripped.
///
/// Used by PRIVMSG and TOPIC, whose final argument may contain spaces.
pub fn trailing(args: &[String]) -> String {
    let joined = args.join(" ");
    match joined.strip_prefix(':') {
        Some(stripped) => stripped.to_owned(),
        None => joined,
    }
}
