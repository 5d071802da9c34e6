//! Request-id correlation for callers that wait on a reply.
//!
//! A caller registers a request, sends a frame carrying its id and blocks
//! on [`PendingRequests::wait`]. The receive path offers every frame to
//! [`PendingRequests::complete`]; a frame whose id is pending is handed
//! to its waiter and not passed on.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use kiln_protocol::{Frame, Header};
use parking_lot::Mutex;

/// Default time a caller waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Why a correlated request produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No reply arrived in time. Safe to retry.
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled before a reply arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The service answered with an `Error` frame.
    #[error("service error: {0}")]
    Service(String),

    #[error("unexpected {0} reply")]
    UnexpectedReply(Header),
}

enum Outcome {
    Reply(Frame),
    Cancelled,
}

/// A registered request. Pass it back to [`PendingRequests::wait`].
#[derive(Debug)]
pub struct Ticket {
    id: i32,
    rx: Receiver<Outcome>,
}

impl Ticket {
    pub fn id(&self) -> i32 {
        self.id
    }
}

#[derive(Default)]
struct Table {
    next_id: i32,
    free: Vec<i32>,
    waiting: HashMap<i32, Sender<Outcome>>,
}

impl Table {
    fn allocate(&mut self) -> i32 {
        while let Some(id) = self.free.pop() {
            if !self.waiting.contains_key(&id) {
                return id;
            }
        }
        loop {
            self.next_id = if self.next_id == i32::MAX { 1 } else { self.next_id + 1 };
            if !self.waiting.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

/// The table of requests awaiting a reply. Ids start at 1. An answered id
/// goes back to the pool; a timed-out or cancelled id is retired, since
/// its reply may still be on the way.
#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id and registers a waiter for it.
    pub fn register(&self) -> Ticket {
        let (tx, rx) = channel::bounded(1);
        let mut table = self.table.lock();
        let id = table.allocate();
        table.waiting.insert(id, tx);
        Ticket { id, rx }
    }

    /// Hands `frame` to its waiter. Returns the frame back if no request
    /// with its id is pending.
    pub fn complete(&self, frame: Frame) -> Result<(), Frame> {
        let tx = {
            let mut table = self.table.lock();
            match table.waiting.remove(&frame.request_id) {
                Some(tx) => {
                    table.free.push(frame.request_id);
                    tx
                }
                None => return Err(frame),
            }
        };
        let _ = tx.send(Outcome::Reply(frame));
        Ok(())
    }

    /// Cancels one request. Returns `false` if it was not pending.
    pub fn cancel(&self, id: i32) -> bool {
        let Some(tx) = self.table.lock().waiting.remove(&id) else {
            return false;
        };
        let _ = tx.send(Outcome::Cancelled);
        true
    }

    /// Cancels every pending request.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.table.lock().waiting.drain().collect();
        for (_, tx) in &drained {
            let _ = tx.send(Outcome::Cancelled);
        }
        drained.len()
    }

    /// Blocks until the reply arrives, the request is cancelled or
    /// `timeout` passes.
    pub fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<Frame, RequestError> {
        match ticket.rx.recv_timeout(timeout) {
            Ok(Outcome::Reply(frame)) => Ok(frame),
            Ok(Outcome::Cancelled) | Err(RecvTimeoutError::Disconnected) => {
                Err(RequestError::Cancelled)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.table.lock().waiting.remove(&ticket.id);
                // The reply may have landed between the timeout and the release.
                match ticket.rx.try_recv() {
                    Ok(Outcome::Reply(frame)) => Ok(frame),
                    _ => Err(RequestError::Timeout),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_ids_start_at_one_and_recycle() {
        let pending = PendingRequests::new();
        let a = pending.register();
        let b = pending.register();
        assert_eq!((a.id(), b.id()), (1, 2));

        assert!(pending.complete(Frame::empty(Header::List, 1)).is_ok());
        assert!(pending.wait(a, Duration::from_millis(10)).is_ok());
        assert_eq!(pending.register().id(), 1);
        drop(b);
    }

    #[test]
    fn test_unmatched_frame_is_returned() {
        let pending = PendingRequests::new();
        let _ticket = pending.register();
        let frame = Frame::empty(Header::InstanceStatus, 0);
        assert_eq!(pending.complete(frame.clone()), Err(frame));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_reply_from_other_thread() {
        let pending = Arc::new(PendingRequests::new());
        let ticket = pending.register();
        let id = ticket.id();

        let responder = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            responder
                .complete(Frame::new(Header::New, id, vec![1, 2, 3]))
                .expect("request should be pending");
        });

        let frame = pending.wait(ticket, Duration::from_secs(5)).expect("reply");
        assert_eq!(frame.payload, [1, 2, 3]);
        assert!(pending.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let pending = PendingRequests::new();

        let ticket = pending.register();
        let id = ticket.id();
        assert_eq!(
            pending.wait(ticket, Duration::from_millis(10)),
            Err(RequestError::Timeout)
        );
        assert!(pending.is_empty());
        // A late reply no longer matches anything.
        assert!(pending.complete(Frame::empty(Header::List, id)).is_err());

        let ticket = pending.register();
        assert!(pending.cancel(ticket.id()));
        assert_eq!(
            pending.wait(ticket, Duration::from_secs(5)),
            Err(RequestError::Cancelled)
        );
    }

    #[test]
    fn test_abandoned_ids_are_not_reused() {
        let pending = PendingRequests::new();

        let timed_out = pending.register();
        let stale_id = timed_out.id();
        assert!(pending.wait(timed_out, Duration::from_millis(10)).is_err());

        let cancelled = pending.register();
        let cancelled_id = cancelled.id();
        assert!(pending.cancel(cancelled_id));

        // A late reply to either must not land on a newer request.
        let next = pending.register();
        assert_ne!(next.id(), stale_id);
        assert_ne!(next.id(), cancelled_id);
        assert!(pending.complete(Frame::empty(Header::List, stale_id)).is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_id_allocation_wraps_past_max() {
        let pending = PendingRequests::new();
        pending.table.lock().next_id = i32::MAX - 1;
        assert_eq!(pending.register().id(), i32::MAX);
        assert_eq!(pending.register().id(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let pending = PendingRequests::new();
        let a = pending.register();
        let b = pending.register();
        assert_eq!(pending.cancel_all(), 2);
        assert_eq!(pending.wait(a, Duration::from_secs(1)), Err(RequestError::Cancelled));
        assert_eq!(pending.wait(b, Duration::from_secs(1)), Err(RequestError::Cancelled));
        assert!(!pending.cancel(1));
    }
}
