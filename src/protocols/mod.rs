//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loops.
//!
//! - `chat`: newline-delimited broadcast chat

pub mod chat;
