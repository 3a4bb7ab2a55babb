//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation gets a unique token (user_data) that identifies
//! the operation type and the session it belongs to when the completion
//! arrives. The token table also owns the operation's buffer, so the
//! memory the kernel reads or writes stays alive until the completion is
//! reaped, even if the session closed in the meantime.

use crate::runtime::SessionId;
use slab::Slab;

/// An in-flight operation.
#[derive(Debug)]
pub enum Op {
    /// Accept operation on listener socket.
    Accept,
    /// Read into `buf` for a session.
    Read {
        session: SessionId,
        buf: Vec<u8>,
    },
    /// Write `buf[offset..]` to a session.
    Write {
        session: SessionId,
        buf: Vec<u8>,
        offset: usize,
    },
}

impl Op {
    /// Session the operation belongs to, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Op::Accept => None,
            Op::Read { session, .. } | Op::Write { session, .. } => Some(*session),
        }
    }
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub struct TokenAllocator {
    ops: Slab<Op>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    ///
    /// Returns the token (user_data value for io_uring).
    pub fn alloc(&mut self, op: Op) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Free a token, handing back the operation and its buffer.
    ///
    /// Returns `None` if the token is invalid or already freed.
    pub fn free(&mut self, token: u64) -> Option<Op> {
        self.ops.try_remove(token as usize)
    }

    /// Number of operations in flight.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut alloc = TokenAllocator::new(16);

        let t1 = alloc.alloc(Op::Accept);
        let t2 = alloc.alloc(Op::Read {
            session: SessionId(1),
            buf: vec![0; 8],
        });
        assert_eq!(alloc.len(), 2);

        let op = alloc.free(t2).unwrap();
        assert_eq!(op.session(), Some(SessionId(1)));
        assert!(matches!(op, Op::Read { ref buf, .. } if buf.len() == 8));

        // Double free is harmless
        assert!(alloc.free(t2).is_none());

        alloc.free(t1);
        assert!(alloc.is_empty());

        // Allocate reuses slot
        let t3 = alloc.alloc(Op::Accept);
        assert_eq!(t3, t1);
    }

    #[test]
    fn test_buffer_address_survives_insert() {
        let mut alloc = TokenAllocator::new(1);
        let buf = vec![1u8, 2, 3];
        let ptr = buf.as_ptr();
        let token = alloc.alloc(Op::Write {
            session: SessionId(9),
            buf,
            offset: 0,
        });
        // Force the slab to grow and move its entries.
        for _ in 0..64 {
            alloc.alloc(Op::Accept);
        }
        match alloc.free(token) {
            Some(Op::Write { buf, .. }) => assert_eq!(buf.as_ptr(), ptr),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
