//! Frame classification for the chat protocol.
//!
//! Decides what the dispatcher does with a decoded frame. Content never
//! signals a disconnect except for an exact quit token; an empty frame
//! is an ordinary zero-length message.

use super::parser::Frame;
use crate::config::QuitPolicy;

/// What to do with one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Broadcast to every other session.
    Forward,
    /// Broadcast, then close the sender.
    ForwardThenClose,
    /// Close the sender without broadcasting.
    Close,
}

impl FrameAction {
    pub fn forwards(self) -> bool {
        matches!(self, FrameAction::Forward | FrameAction::ForwardThenClose)
    }

    pub fn closes(self) -> bool {
        matches!(self, FrameAction::ForwardThenClose | FrameAction::Close)
    }
}

/// Classify a frame. The quit token must match exactly, case included.
///
/// The token is never empty (config validation), so an empty frame is
/// always forwarded.
pub fn classify(frame: &Frame, quit_token: &str, policy: QuitPolicy) -> FrameAction {
    if frame.is_empty() || frame.as_bytes() != quit_token.as_bytes() {
        return FrameAction::Forward;
    }
    match policy {
        QuitPolicy::ForwardThenClose => FrameAction::ForwardThenClose,
        QuitPolicy::CloseOnly => FrameAction::Close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinary_frame_forwards() {
        let action = classify(&Frame::new("hello"), "quit", QuitPolicy::ForwardThenClose);
        assert_eq!(action, FrameAction::Forward);
        assert!(action.forwards());
        assert!(!action.closes());
    }

    #[test]
    fn test_empty_frame_forwards() {
        let action = classify(&Frame::new(""), "quit", QuitPolicy::ForwardThenClose);
        assert_eq!(action, FrameAction::Forward);
    }

    #[test]
    fn test_quit_forward_then_close() {
        let action = classify(&Frame::new("quit"), "quit", QuitPolicy::ForwardThenClose);
        assert_eq!(action, FrameAction::ForwardThenClose);
        assert!(action.forwards());
        assert!(action.closes());
    }

    #[test]
    fn test_quit_close_only() {
        let action = classify(&Frame::new("quit"), "quit", QuitPolicy::CloseOnly);
        assert_eq!(action, FrameAction::Close);
        assert!(!action.forwards());
    }

    #[test]
    fn test_quit_is_exact_and_case_sensitive() {
        for line in ["QUIT", "Quit", "quit ", " quit", "quit\r", "quitting"] {
            let action = classify(&Frame::new(line), "quit", QuitPolicy::ForwardThenClose);
            assert_eq!(action, FrameAction::Forward, "line {line:?}");
        }
    }
}
