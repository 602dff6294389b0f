//! Incremental Memcached Text Protocol Parser
//!
//! The parser only understands command header lines. It is fed whatever bytes
//! the socket produced and either completes a header or retains the partial
//! line until more data arrives.
//!
//! ## How the Parser Works
//!
//! [`Parser::parse`] returns:
//! - `Ok(Parsed::Complete { command, consumed, body_len })` - a header line was
//!   parsed from the first `consumed` bytes of the input
//! - `Ok(Parsed::Incomplete)` - every input byte was retained as part of a
//!   partial header line
//! - `Err(ParseError)` - invalid protocol data
//!
//! The data block of a storage command is not the parser's business: the
//! caller reads `body_len + 2` further bytes (the block and its CRLF) and
//! checks them with [`take_data_block`].

use crate::protocol::types::{Command, StoreMode, CRLF};
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use thiserror::Error;

/// Errors that can occur while parsing a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The command name is not recognized
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The header line exceeds [`MAX_LINE_LENGTH`]
    #[error("line too long")]
    LineTooLong,

    /// Wrong number of arguments or an unparsable number
    #[error("bad command line format")]
    BadFormat,

    /// Key longer than [`MAX_KEY_LENGTH`] or containing control characters
    #[error("invalid key")]
    InvalidKey,

    /// The data block exceeds [`MAX_VALUE_SIZE`]
    #[error("object too large for cache: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// The data block was not terminated by CRLF
    #[error("bad data chunk")]
    BadDataChunk,
}

impl ParseError {
    /// Returns the protocol line sent back for this error.
    pub fn reply(&self) -> crate::protocol::Reply {
        use crate::protocol::Reply;

        match self {
            ParseError::UnknownCommand(_) => Reply::Error,
            ParseError::ValueTooLarge { .. } => Reply::server_error("object too large for cache"),
            other => Reply::client_error(other.to_string()),
        }
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum length of a header line, including its terminator
pub const MAX_LINE_LENGTH: usize = 2048;

/// Maximum key length
pub const MAX_KEY_LENGTH: usize = 250;

/// Maximum size of a single value (1 MiB)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Outcome of feeding bytes to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// All input was retained; a header line is still incomplete
    Incomplete,
    /// A header line was parsed
    Complete {
        command: Command,
        /// Bytes of the current input that belonged to the header
        consumed: usize,
        /// Length of the data block that must follow
        body_len: Option<usize>,
    },
}

/// An incremental header-line parser.
///
/// # Example
///
/// ```
/// use tidekv::protocol::{Command, Parsed, Parser};
///
/// let mut parser = Parser::new();
/// assert_eq!(parser.parse(b"ver").unwrap(), Parsed::Incomplete);
///
/// match parser.parse(b"sion\r\nget a\r\n").unwrap() {
///     Parsed::Complete { command, consumed, body_len } => {
///         assert_eq!(command, Command::Version);
///         assert_eq!(consumed, 6);
///         assert_eq!(body_len, None);
///     }
///     Parsed::Incomplete => unreachable!(),
/// }
/// ```
#[derive(Debug, Default)]
pub struct Parser {
    /// Partial header line carried over from earlier calls
    pending: BytesMut,
}

impl Parser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
        }
    }

    /// Feeds `buf` to the parser.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Parsed> {
        let Some(newline) = memchr(b'\n', buf) else {
            if self.pending.len() + buf.len() >= MAX_LINE_LENGTH {
                return Err(ParseError::LineTooLong);
            }
            self.pending.extend_from_slice(buf);
            return Ok(Parsed::Incomplete);
        };

        let consumed = newline + 1;
        if self.pending.len() + consumed > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong);
        }

        let command = if self.pending.is_empty() {
            parse_line(&buf[..newline])?
        } else {
            self.pending.extend_from_slice(&buf[..newline]);
            let line = self.pending.split();
            parse_line(&line)?
        };

        let body_len = command.body_len();
        Ok(Parsed::Complete {
            command,
            consumed,
            body_len,
        })
    }

    /// Returns true if part of a header line is buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drops any buffered partial line.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Validates a received data block (`<data>\r\n`) and strips its terminator.
pub fn take_data_block(mut block: BytesMut) -> ParseResult<Bytes> {
    if !block.ends_with(CRLF) {
        return Err(ParseError::BadDataChunk);
    }
    block.truncate(block.len() - CRLF.len());
    Ok(block.freeze())
}

/// Parses one header line without its `\n` (a trailing `\r` is tolerated).
fn parse_line(line: &[u8]) -> ParseResult<Command> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut tokens = line
        .split(|&b| b == b' ')
        .filter(|token| !token.is_empty());

    let Some(name) = tokens.next() else {
        return Err(ParseError::UnknownCommand(String::new()));
    };
    let args: Vec<&[u8]> = tokens.collect();

    match name {
        b"set" => parse_store(StoreMode::Set, &args),
        b"add" => parse_store(StoreMode::Add, &args),
        b"replace" => parse_store(StoreMode::Replace, &args),
        b"append" => parse_store(StoreMode::Append, &args),
        b"prepend" => parse_store(StoreMode::Prepend, &args),
        b"get" | b"gets" => {
            if args.is_empty() {
                return Err(ParseError::BadFormat);
            }
            let keys = args
                .iter()
                .map(|key| parse_key(key))
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(Command::Get { keys })
        }
        b"delete" => {
            let noreply = parse_noreply(&args, 1)?;
            Ok(Command::Delete {
                key: parse_key(args[0])?,
                noreply,
            })
        }
        b"incr" | b"decr" => {
            let noreply = parse_noreply(&args, 2)?;
            let key = parse_key(args[0])?;
            let delta = parse_number(args[1])?;
            Ok(if name == b"incr" {
                Command::Incr {
                    key,
                    delta,
                    noreply,
                }
            } else {
                Command::Decr {
                    key,
                    delta,
                    noreply,
                }
            })
        }
        b"flush_all" => Ok(Command::FlushAll {
            noreply: parse_noreply(&args, 0)?,
        }),
        b"version" => no_args(&args, Command::Version),
        b"stats" => no_args(&args, Command::Stats),
        b"quit" => no_args(&args, Command::Quit),
        other => Err(ParseError::UnknownCommand(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn parse_store(mode: StoreMode, args: &[&[u8]]) -> ParseResult<Command> {
    let noreply = parse_noreply(args, 4)?;
    let key = parse_key(args[0])?;
    let flags = parse_number(args[1])?;
    let exptime = parse_number(args[2])?;
    let bytes: usize = parse_number(args[3])?;

    if bytes > MAX_VALUE_SIZE {
        return Err(ParseError::ValueTooLarge {
            size: bytes,
            max: MAX_VALUE_SIZE,
        });
    }

    Ok(Command::Store {
        mode,
        key,
        flags,
        exptime,
        bytes,
        noreply,
    })
}

/// Checks the argument count and an optional trailing `noreply`.
fn parse_noreply(args: &[&[u8]], required: usize) -> ParseResult<bool> {
    match args.len() {
        n if n == required => Ok(false),
        n if n == required + 1 && args[required] == b"noreply" => Ok(true),
        _ => Err(ParseError::BadFormat),
    }
}

fn no_args(args: &[&[u8]], command: Command) -> ParseResult<Command> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::BadFormat)
    }
}

fn parse_key(key: &[u8]) -> ParseResult<Bytes> {
    if key.len() > MAX_KEY_LENGTH || key.iter().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidKey);
    }
    Ok(Bytes::copy_from_slice(key))
}

fn parse_number<T: std::str::FromStr>(token: &[u8]) -> ParseResult<T> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::BadFormat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;

    fn complete(parser: &mut Parser, input: &[u8]) -> (Command, usize, Option<usize>) {
        match parser.parse(input).unwrap() {
            Parsed::Complete {
                command,
                consumed,
                body_len,
            } => (command, consumed, body_len),
            Parsed::Incomplete => panic!("expected a complete header"),
        }
    }

    #[test]
    fn test_parse_set() {
        let mut parser = Parser::new();
        let (command, consumed, body_len) = complete(&mut parser, b"set name 5 0 4\r\nAriz\r\n");

        assert_eq!(
            command,
            Command::Store {
                mode: StoreMode::Set,
                key: Bytes::from("name"),
                flags: 5,
                exptime: 0,
                bytes: 4,
                noreply: false,
            }
        );
        assert_eq!(consumed, 16);
        assert_eq!(body_len, Some(4));
    }

    #[test]
    fn test_parse_store_noreply_and_negative_exptime() {
        let mut parser = Parser::new();
        let (command, _, _) = complete(&mut parser, b"add k 0 -1 2 noreply\r\n");
        assert!(matches!(
            command,
            Command::Store {
                mode: StoreMode::Add,
                exptime: -1,
                noreply: true,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_get_multi() {
        let mut parser = Parser::new();
        let (command, consumed, body_len) = complete(&mut parser, b"get a  b c\r\n");
        assert_eq!(
            command,
            Command::Get {
                keys: vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
            }
        );
        assert_eq!(consumed, 12);
        assert_eq!(body_len, None);
    }

    #[test]
    fn test_parse_simple_commands() {
        let mut parser = Parser::new();
        assert_eq!(complete(&mut parser, b"version\r\n").0, Command::Version);
        assert_eq!(complete(&mut parser, b"stats\r\n").0, Command::Stats);
        assert_eq!(complete(&mut parser, b"quit\r\n").0, Command::Quit);
        assert_eq!(
            complete(&mut parser, b"flush_all noreply\r\n").0,
            Command::FlushAll { noreply: true }
        );
        assert_eq!(
            complete(&mut parser, b"incr n 10\r\n").0,
            Command::Incr {
                key: Bytes::from("n"),
                delta: 10,
                noreply: false
            }
        );
        assert_eq!(
            complete(&mut parser, b"delete n noreply\r\n").0,
            Command::Delete {
                key: Bytes::from("n"),
                noreply: true
            }
        );
    }

    #[test]
    fn test_bare_newline_accepted() {
        let mut parser = Parser::new();
        assert_eq!(complete(&mut parser, b"version\n").0, Command::Version);
    }

    #[test]
    fn test_split_header_is_retained() {
        let mut parser = Parser::new();

        assert_eq!(parser.parse(b"get ke").unwrap(), Parsed::Incomplete);
        assert!(parser.has_pending());
        assert_eq!(parser.parse(b"y1 key").unwrap(), Parsed::Incomplete);

        let (command, consumed, _) = complete(&mut parser, b"2\r\nversion\r\n");
        assert_eq!(
            command,
            Command::Get {
                keys: vec![Bytes::from("key1"), Bytes::from("key2")]
            }
        );
        assert_eq!(consumed, 3);
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_split_on_crlf_boundary() {
        let mut parser = Parser::new();
        assert_eq!(parser.parse(b"quit\r").unwrap(), Parsed::Incomplete);
        let (command, consumed, _) = complete(&mut parser, b"\n");
        assert_eq!(command, Command::Quit);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_pipelined_headers() {
        let mut parser = Parser::new();
        let input = b"get a\r\nget b\r\n";

        let (first, consumed, _) = complete(&mut parser, input);
        assert_eq!(first, Command::Get { keys: vec![Bytes::from("a")] });

        let (second, rest, _) = complete(&mut parser, &input[consumed..]);
        assert_eq!(second, Command::Get { keys: vec![Bytes::from("b")] });
        assert_eq!(consumed + rest, input.len());
    }

    #[test]
    fn test_unknown_command() {
        let mut parser = Parser::new();
        let err = parser.parse(b"frobnicate x\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnknownCommand("frobnicate".into()));
        assert_eq!(err.reply(), Reply::Error);

        assert!(matches!(
            parser.parse(b"\r\n"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_bad_format() {
        let mut parser = Parser::new();
        assert_eq!(parser.parse(b"set k 0 0\r\n"), Err(ParseError::BadFormat));
        assert_eq!(parser.parse(b"set k x 0 1\r\n"), Err(ParseError::BadFormat));
        assert_eq!(parser.parse(b"incr k -1\r\n"), Err(ParseError::BadFormat));
        assert_eq!(parser.parse(b"get\r\n"), Err(ParseError::BadFormat));
        assert_eq!(parser.parse(b"version now\r\n"), Err(ParseError::BadFormat));
        assert_eq!(
            parser.parse(b"delete k later\r\n"),
            Err(ParseError::BadFormat)
        );
        assert_eq!(
            ParseError::BadFormat.reply(),
            Reply::client_error("bad command line format")
        );
    }

    #[test]
    fn test_limits() {
        let mut parser = Parser::new();

        let long_key = format!("get {}\r\n", "k".repeat(MAX_KEY_LENGTH + 1));
        assert_eq!(parser.parse(long_key.as_bytes()), Err(ParseError::InvalidKey));

        assert_eq!(
            parser.parse(b"get a\x01b\r\n"),
            Err(ParseError::InvalidKey)
        );

        let huge = format!("set k 0 0 {}\r\n", MAX_VALUE_SIZE + 1);
        let err = parser.parse(huge.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::ValueTooLarge { .. }));
        assert_eq!(err.reply(), Reply::server_error("object too large for cache"));
    }

    #[test]
    fn test_line_too_long() {
        let mut parser = Parser::new();
        let chunk = vec![b'a'; MAX_LINE_LENGTH / 2];

        assert_eq!(parser.parse(&chunk).unwrap(), Parsed::Incomplete);
        assert_eq!(parser.parse(&chunk), Err(ParseError::LineTooLong));
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let mut parser = Parser::new();
        assert_eq!(parser.parse(b"garbage").unwrap(), Parsed::Incomplete);
        parser.reset();
        assert_eq!(complete(&mut parser, b"version\r\n").0, Command::Version);
    }

    #[test]
    fn test_take_data_block() {
        let block = BytesMut::from(&b"hel\x00o\r\n"[..]);
        assert_eq!(take_data_block(block).unwrap(), Bytes::from(&b"hel\x00o"[..]));

        let block = BytesMut::from(&b"hello!!"[..]);
        assert_eq!(take_data_block(block), Err(ParseError::BadDataChunk));
    }
}
