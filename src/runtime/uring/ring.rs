//! io_uring instance shared by the reaper thread and the worker pool.
//!
//! Workers push submissions concurrently, serialized by `sq_lock`. Only
//! the reaper thread touches the completion queue.

use io_uring::{squeue, IoUring};
use std::io;
use std::sync::{Mutex, PoisonError};

pub struct Ring {
    uring: IoUring,
    sq_lock: Mutex<()>,
}

// SAFETY: the submission queue is only accessed with `sq_lock` held and
// the completion queue only from the single reaper thread.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            uring: IoUring::new(entries)?,
            sq_lock: Mutex::new(()),
        })
    }

    /// Queue one entry and submit it to the kernel.
    ///
    /// # Safety
    /// Any buffer referenced by `entry` must stay valid until its
    /// completion is reaped.
    pub unsafe fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        let _guard = self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut sq = self.uring.submission_shared();
            sq.push(entry)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;
        }
        self.uring.submit()?;
        Ok(())
    }

    /// Block until at least one completion is available and move up to
    /// `limit` of them into `out` as `(user_data, result)` pairs.
    ///
    /// Must only be called from the reaper thread.
    pub fn reap(&self, out: &mut Vec<(u64, i32)>, limit: usize) -> io::Result<()> {
        match self.uring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        // SAFETY: the reaper is the only consumer of the completion queue.
        let cq = unsafe { self.uring.completion_shared() };
        out.extend(cq.take(limit).map(|cqe| (cqe.user_data(), cqe.result())));
        Ok(())
    }
}
