//! Per-session completion state machine.
//!
//! Every completion (and every frame queued by a peer's broadcast) is fed
//! through `step`, which returns the next state and the one action the
//! worker must take. The function is pure so the re-arming rules can be
//! tested without a ring or a socket.
//!
//! ```text
//! Connecting --Accepted--> Reading --ReadDone(n>0)--> Broadcasting
//!     Broadcasting --Decoded{close: false}--> Reading
//!     Broadcasting --Decoded{close: true}--> Closed
//!     Reading --ReadDone(n<=0)--> Closed
//! ```
//!
//! The write side runs beside the read side: at most one write is in
//! flight, started by `Enqueued` and re-armed by `WriteDone` while bytes
//! remain.

/// Read side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    /// A read is in flight.
    Reading,
    /// A read completed; frames are being decoded and broadcast.
    Broadcasting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub phase: Phase,
    /// A write is in flight.
    pub writing: bool,
}

impl LinkState {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Connecting,
            writing: false,
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The accept completed and the session is being registered.
    Accepted,
    /// A read completed with the raw result (bytes, 0 for EOF, -errno).
    ReadDone { result: i32 },
    /// Frames from the last read were handled.
    Decoded { close: bool },
    /// A peer queued a frame on this session.
    Enqueued,
    /// A write completed. `remaining` is the unwritten tail of the
    /// in-flight buffer; `queued` whether more frames are waiting.
    WriteDone {
        result: i32,
        remaining: usize,
        queued: bool,
    },
}

/// What the worker must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    SubmitRead,
    Decode,
    SubmitWrite,
    Close,
}

/// Advance one session.
pub fn step(state: LinkState, event: Completion) -> (LinkState, Action) {
    use Completion::*;
    use Phase::*;

    if state.phase == Closed {
        return (state, Action::None);
    }

    let closed = LinkState {
        phase: Closed,
        writing: false,
    };

    match (state.phase, event) {
        (Connecting, Accepted) => (
            LinkState {
                phase: Reading,
                ..state
            },
            Action::SubmitRead,
        ),

        (Reading, ReadDone { result }) if result <= 0 => (closed, Action::Close),
        (Reading, ReadDone { .. }) => (
            LinkState {
                phase: Broadcasting,
                ..state
            },
            Action::Decode,
        ),

        (Broadcasting, Decoded { close: true }) => (closed, Action::Close),
        (Broadcasting, Decoded { close: false }) => (
            LinkState {
                phase: Reading,
                ..state
            },
            Action::SubmitRead,
        ),

        (Reading | Broadcasting, Enqueued) if !state.writing => (
            LinkState {
                writing: true,
                ..state
            },
            Action::SubmitWrite,
        ),

        (_, WriteDone { result, .. }) if result <= 0 => (closed, Action::Close),
        (_, WriteDone {
            remaining, queued, ..
        }) if remaining > 0 || queued => (state, Action::SubmitWrite),
        (_, WriteDone { .. }) => (
            LinkState {
                writing: false,
                ..state
            },
            Action::None,
        ),

        // Stale or out-of-order input leaves the state alone.
        _ => (state, Action::None),
    }
}

/// Clamp a buffer length to what one submission entry can carry. The
/// unsubmitted tail is picked up by the next write.
pub fn submission_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Offset of the first unwritten byte after a write of `buf[offset..]`
/// completed with `result`. A failed write leaves the offset unchanged.
pub fn resume_offset(buf_len: usize, offset: usize, result: i32) -> usize {
    let written = usize::try_from(result).unwrap_or(0);
    offset.saturating_add(written).min(buf_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> LinkState {
        step(LinkState::new(), Completion::Accepted).0
    }

    #[test]
    fn test_accept_issues_first_read() {
        let (state, action) = step(LinkState::new(), Completion::Accepted);
        assert_eq!(state.phase, Phase::Reading);
        assert_eq!(action, Action::SubmitRead);
    }

    #[test]
    fn test_read_decode_read_cycle() {
        let (state, action) = step(reading(), Completion::ReadDone { result: 5 });
        assert_eq!(state.phase, Phase::Broadcasting);
        assert_eq!(action, Action::Decode);

        let (state, action) = step(state, Completion::Decoded { close: false });
        assert_eq!(state.phase, Phase::Reading);
        assert_eq!(action, Action::SubmitRead);
    }

    #[test]
    fn test_eof_and_error_close() {
        for result in [0, -104] {
            let (state, action) = step(reading(), Completion::ReadDone { result });
            assert!(state.is_closed());
            assert_eq!(action, Action::Close);
        }
    }

    #[test]
    fn test_quit_closes_after_broadcast() {
        let (state, _) = step(reading(), Completion::ReadDone { result: 5 });
        let (state, action) = step(state, Completion::Decoded { close: true });
        assert!(state.is_closed());
        assert_eq!(action, Action::Close);
    }

    #[test]
    fn test_single_write_in_flight() {
        let (state, action) = step(reading(), Completion::Enqueued);
        assert!(state.writing);
        assert_eq!(action, Action::SubmitWrite);

        let (state, action) = step(state, Completion::Enqueued);
        assert!(state.writing);
        assert_eq!(action, Action::None);
    }

    #[test]
    fn test_partial_write_resubmits() {
        let (state, _) = step(reading(), Completion::Enqueued);
        let (state, action) = step(
            state,
            Completion::WriteDone {
                result: 3,
                remaining: 4,
                queued: false,
            },
        );
        assert!(state.writing);
        assert_eq!(action, Action::SubmitWrite);
    }

    #[test]
    fn test_write_chain_continues_while_queued() {
        let (state, _) = step(reading(), Completion::Enqueued);
        let (state, action) = step(
            state,
            Completion::WriteDone {
                result: 7,
                remaining: 0,
                queued: true,
            },
        );
        assert!(state.writing);
        assert_eq!(action, Action::SubmitWrite);

        let (state, action) = step(
            state,
            Completion::WriteDone {
                result: 7,
                remaining: 0,
                queued: false,
            },
        );
        assert!(!state.writing);
        assert_eq!(action, Action::None);
        assert_eq!(state.phase, Phase::Reading);
    }

    #[test]
    fn test_write_failure_closes() {
        let (state, _) = step(reading(), Completion::Enqueued);
        let (state, action) = step(
            state,
            Completion::WriteDone {
                result: -32,
                remaining: 0,
                queued: false,
            },
        );
        assert!(state.is_closed());
        assert_eq!(action, Action::Close);
    }

    #[test]
    fn test_closed_absorbs_everything() {
        let (closed, _) = step(reading(), Completion::ReadDone { result: 0 });
        for event in [
            Completion::Accepted,
            Completion::ReadDone { result: 10 },
            Completion::Decoded { close: false },
            Completion::Enqueued,
            Completion::WriteDone {
                result: 1,
                remaining: 1,
                queued: true,
            },
        ] {
            assert_eq!(step(closed, event), (closed, Action::None));
        }
    }

    #[test]
    fn test_out_of_order_input_ignored() {
        // A read completion while no read is outstanding changes nothing.
        let (state, _) = step(reading(), Completion::ReadDone { result: 5 });
        let (next, action) = step(state, Completion::ReadDone { result: 5 });
        assert_eq!(next, state);
        assert_eq!(action, Action::None);

        // Nothing is queued on a session that is still connecting.
        let (next, action) = step(LinkState::new(), Completion::Enqueued);
        assert_eq!(next, LinkState::new());
        assert_eq!(action, Action::None);
    }

    #[test]
    fn test_resume_offset_after_short_writes() {
        // 10-byte buffer written 3, then 4, then the last 3 bytes.
        assert_eq!(resume_offset(10, 0, 3), 3);
        assert_eq!(resume_offset(10, 3, 4), 7);
        assert_eq!(resume_offset(10, 7, 3), 10);
    }

    #[test]
    fn test_resume_offset_ignores_errors_and_overshoot() {
        assert_eq!(resume_offset(10, 4, -32), 4);
        assert_eq!(resume_offset(10, 4, 0), 4);
        assert_eq!(resume_offset(10, 8, 5), 10);
    }

    #[test]
    fn test_submission_len_is_clamped() {
        assert_eq!(submission_len(4096), 4096);
        assert_eq!(submission_len(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(submission_len(u32::MAX as usize + 7), u32::MAX);
    }
}
