//! Fan-out of one frame to every session except its sender.
//!
//! The frame is encoded once and shared by reference count. Delivery to
//! each recipient goes through a backend-specific `Deliver` sink; a
//! failing recipient is reported back for removal and never stops the
//! remaining deliveries.

use crate::protocols::chat::parser::{encode, Frame};
use crate::runtime::registry::SessionRegistry;
use crate::runtime::session::{Session, SessionId};
use bytes::Bytes;
use std::io;
use tracing::{debug, warn};

/// Backend hook that hands an encoded frame to one recipient.
pub trait Deliver<S> {
    fn deliver(&mut self, session: &mut Session<S>, frame: Bytes) -> io::Result<()>;
}

/// Outcome of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Recipients the frame was queued for.
    pub delivered: usize,
    /// Recipients whose delivery failed; the caller removes them.
    pub failed: Vec<(SessionId, io::Error)>,
}

/// Queue `frame` from `sender` on every other active session.
pub fn broadcast<S, D>(
    registry: &mut SessionRegistry<S>,
    sender: SessionId,
    label: &str,
    frame: &Frame,
    sink: &mut D,
) -> BroadcastReport
where
    D: Deliver<S>,
{
    let encoded = encode(label, frame);
    let mut report = BroadcastReport::default();

    for id in registry.ids() {
        if id == sender {
            continue;
        }
        // Sessions gone or closing since the snapshot are skipped.
        let Some(session) = registry.get_mut(id) else {
            continue;
        };
        if !session.is_active() {
            continue;
        }
        match sink.deliver(session, encoded.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(session = %id, sender = %sender, error = %e, "Delivery failed");
                report.failed.push((id, e));
            }
        }
    }

    debug!(
        sender = %sender,
        recipients = report.delivered,
        bytes = frame.len(),
        "Frame forwarded"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queues frames and fails for the listed ids.
    struct QueueSink {
        fail: Vec<SessionId>,
    }

    impl Deliver<()> for QueueSink {
        fn deliver(&mut self, session: &mut Session<()>, frame: Bytes) -> io::Result<()> {
            if self.fail.contains(&session.id) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            session.queue_frame(frame);
            Ok(())
        }
    }

    fn registry(n: u64) -> SessionRegistry<()> {
        let mut registry = SessionRegistry::new();
        for id in 1..=n {
            let peer = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
            let mut s = Session::new(SessionId(id), peer, ());
            s.activate();
            registry.add(s);
        }
        registry
    }

    fn drain(registry: &mut SessionRegistry<()>, id: u64) -> Vec<u8> {
        registry
            .get_mut(SessionId(id))
            .unwrap()
            .outbound_mut()
            .take_coalesced()
    }

    #[test]
    fn test_delivers_to_all_but_sender() {
        let mut reg = registry(4);
        let mut sink = QueueSink { fail: vec![] };
        let report = broadcast(&mut reg, SessionId(2), "client[40002]", &Frame::new("hi"), &mut sink);

        assert_eq!(report.delivered, 3);
        assert!(report.failed.is_empty());
        for id in [1, 3, 4] {
            assert_eq!(drain(&mut reg, id), b"client[40002]: hi\n");
        }
        assert!(drain(&mut reg, 2).is_empty());
    }

    #[test]
    fn test_failure_is_isolated() {
        let mut reg = registry(4);
        let mut sink = QueueSink {
            fail: vec![SessionId(3)],
        };
        let report = broadcast(&mut reg, SessionId(1), "a", &Frame::new("x"), &mut sink);

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, SessionId(3));
        assert_eq!(drain(&mut reg, 2), b"a: x\n");
        assert_eq!(drain(&mut reg, 4), b"a: x\n");
    }

    #[test]
    fn test_removed_session_is_skipped() {
        let mut reg = registry(3);
        reg.remove(SessionId(2));

        let mut sink = QueueSink { fail: vec![] };
        let report = broadcast(&mut reg, SessionId(1), "a", &Frame::new("y"), &mut sink);
        assert_eq!(report.delivered, 1);
        assert!(report.failed.is_empty());
        assert_eq!(drain(&mut reg, 3), b"a: y\n");
    }

    #[test]
    fn test_empty_frame_is_forwarded() {
        let mut reg = registry(2);
        let mut sink = QueueSink { fail: vec![] };
        let report = broadcast(&mut reg, SessionId(1), "a", &Frame::new(""), &mut sink);
        assert_eq!(report.delivered, 1);
        assert_eq!(drain(&mut reg, 2), b"a: \n");
    }

    #[test]
    fn test_lone_sender_reaches_no_one() {
        let mut reg = registry(1);
        let mut sink = QueueSink { fail: vec![] };
        let report = broadcast(&mut reg, SessionId(1), "a", &Frame::new("z"), &mut sink);
        assert_eq!(report.delivered, 0);
        assert!(report.failed.is_empty());
    }
}
