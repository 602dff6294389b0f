//! Memcached Text Protocol Implementation
//!
//! This module implements the subset of the memcached text protocol that
//! TideKV speaks.
//!
//! ## Modules
//!
//! - `types`: Defines the `Command` and `Reply` enums and reply serialization
//! - `parser`: Incremental parser for command header lines
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{take_data_block, Parsed, Parser, Reply};
//! use bytes::BytesMut;
//!
//! let mut parser = Parser::new();
//! let input = b"set name 0 0 4\r\nAriz\r\n";
//!
//! let Parsed::Complete { consumed, body_len, .. } = parser.parse(input).unwrap() else {
//!     panic!("incomplete");
//! };
//! let block = BytesMut::from(&input[consumed..consumed + body_len.unwrap() + 2]);
//! assert_eq!(&take_data_block(block).unwrap()[..], b"Ariz");
//!
//! assert_eq!(&Reply::Stored.serialize()[..], b"STORED\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{
    take_data_block, ParseError, ParseResult, Parsed, Parser, MAX_KEY_LENGTH, MAX_LINE_LENGTH,
    MAX_VALUE_SIZE,
};
pub use types::{Command, Reply, StoreMode, CRLF};
