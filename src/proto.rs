//! Parsing for the client side of the Kalah Game Protocol.
//!
//! KGP is line oriented. Every message has the shape
//! `[id[@ref]] command [args…]`: an optional numeric message id, an
//! optional reference to an earlier message, and a command word. The
//! server numbers its `state` requests; clients answer with `move` or
//! `yield` lines whose reference names the request they reply to. A
//! reply without a reference is taken to address the current request.
//!
//! Pits are 1-indexed on the wire and 0-indexed everywhere else in the
//! server.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("missing argument to {0:?}")]
    MissingArgument(&'static str),
    #[error("malformed number {0:?}")]
    BadNumber(String),
    #[error("there is no pit {0}")]
    BadPit(u64),
}

/// A message from the client, without its addressing envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Choose a move for the current state request. The pit is 0-indexed.
    Move { pit: usize, comment: Option<String> },
    /// Give up the remaining thinking time for the current request.
    Yield,
    /// Client metadata (`set name …`, `set token …`, …).
    Set { key: String, value: String },
    /// Select a protocol dialect and signal readiness to play.
    Mode { name: String },
    /// Orderly disconnect.
    Goodbye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub id: Option<u64>,
    pub reference: Option<u64>,
    pub command: Command,
}

/// A parse failure, keeping the message id (when one could be read) so
/// the error frame can reference the offending message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub id: Option<u64>,
    pub error: ProtocolError,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

fn number(word: &str) -> Result<u64, ProtocolError> {
    word.parse()
        .map_err(|_| ProtocolError::BadNumber(word.to_string()))
}

/// Split an `id`, `id@ref` or `@ref` envelope token.
fn envelope(word: &str) -> Result<(Option<u64>, Option<u64>), ProtocolError> {
    match word.split_once('@') {
        Some(("", reference)) => Ok((None, Some(number(reference)?))),
        Some((id, reference)) => Ok((Some(number(id)?), Some(number(reference)?))),
        None => Ok((Some(number(word)?), None)),
    }
}

pub fn parse(line: &str) -> Result<Line, ParseFailure> {
    let mut words = line.split_whitespace();

    let mut id = None;
    let mut reference = None;
    let mut head = words.next().ok_or(ParseFailure {
        id: None,
        error: ProtocolError::Empty,
    })?;
    if head.starts_with(|c: char| c.is_ascii_digit() || c == '@') {
        (id, reference) = envelope(head).map_err(|error| ParseFailure { id: None, error })?;
        head = words.next().ok_or(ParseFailure {
            id,
            error: ProtocolError::Empty,
        })?;
    }

    let fail = |error| ParseFailure { id, error };
    let command = match head {
        "move" => {
            let word = words
                .next()
                .ok_or_else(|| fail(ProtocolError::MissingArgument("move")))?;
            let pit = number(word).map_err(&fail)?;
            if pit == 0 {
                return Err(fail(ProtocolError::BadPit(pit)));
            }
            let rest = words.collect::<Vec<_>>().join(" ");
            Command::Move {
                pit: (pit - 1) as usize,
                comment: (!rest.is_empty()).then_some(rest),
            }
        }
        "yield" => Command::Yield,
        "set" => {
            let key = words
                .next()
                .ok_or_else(|| fail(ProtocolError::MissingArgument("set")))?
                .to_string();
            let value = words.collect::<Vec<_>>().join(" ");
            if value.is_empty() {
                return Err(fail(ProtocolError::MissingArgument("set")));
            }
            Command::Set { key, value }
        }
        "mode" => {
            let name = words
                .next()
                .ok_or_else(|| fail(ProtocolError::MissingArgument("mode")))?
                .to_string();
            Command::Mode { name }
        }
        "goodbye" => Command::Goodbye,
        other => return Err(fail(ProtocolError::UnknownCommand(other.to_string()))),
    };

    Ok(Line {
        id,
        reference,
        command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command() {
        let line = parse("yield").expect("parse");
        assert_eq!(line.id, None);
        assert_eq!(line.reference, None);
        assert_eq!(line.command, Command::Yield);
    }

    #[test]
    fn envelope_forms() {
        assert_eq!(parse("12 yield").unwrap().id, Some(12));
        let line = parse("12@7 yield").unwrap();
        assert_eq!((line.id, line.reference), (Some(12), Some(7)));
        let line = parse("@7 move 3").unwrap();
        assert_eq!((line.id, line.reference), (None, Some(7)));
    }

    #[test]
    fn moves_are_one_indexed_on_the_wire() {
        match parse("move 3").unwrap().command {
            Command::Move { pit, comment } => {
                assert_eq!(pit, 2);
                assert_eq!(comment, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(
            parse("move 0").unwrap_err().error,
            ProtocolError::BadPit(0)
        );
    }

    #[test]
    fn move_comment_is_the_rest_of_the_line() {
        match parse("@4 move 2 pretty sure about this").unwrap().command {
            Command::Move { pit, comment } => {
                assert_eq!(pit, 1);
                assert_eq!(comment.as_deref(), Some("pretty sure about this"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn set_and_mode() {
        assert_eq!(
            parse("set name deep thought").unwrap().command,
            Command::Set {
                key: "name".into(),
                value: "deep thought".into()
            }
        );
        assert_eq!(
            parse("mode simple").unwrap().command,
            Command::Mode {
                name: "simple".into()
            }
        );
    }

    #[test]
    fn errors_keep_the_message_id() {
        let failure = parse("23 frobnicate now").unwrap_err();
        assert_eq!(failure.id, Some(23));
        assert_eq!(
            failure.error,
            ProtocolError::UnknownCommand("frobnicate".into())
        );
        assert_eq!(parse("   ").unwrap_err().error, ProtocolError::Empty);
        assert_eq!(
            parse("x@y move 1").unwrap_err().error,
            ProtocolError::UnknownCommand("x@y".into())
        );
    }
}
