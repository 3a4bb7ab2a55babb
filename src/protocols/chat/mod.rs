//! Line-oriented chat protocol.
//!
//! Plain UTF-8 text, one frame per `\n`-terminated line:
//! - Client sends: `<message>\n`
//! - Server forwards to every other client: `<sender-label>: <message>\n`
//!
//! ## Protocol Format
//!
//! ```text
//! Client A:  hi\n
//! Client B:  client[51234]: hi\n
//! ```
//!
//! The quit token (`quit` by default) on a line of its own ends the
//! sending session. There is no handshake and no length negotiation;
//! a line longer than the configured maximum drops the session.

pub mod handler;
pub mod parser;

pub use handler::classify;
pub use parser::Frame;
