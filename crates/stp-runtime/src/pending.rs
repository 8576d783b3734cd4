use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stp_frame::Frame;
use tracing::trace;

use crate::error::{Result, ScopeError};

pub(crate) type CallResult = Result<Frame>;

/// Where the reactor delivers a call's outcome.
pub(crate) enum ResultSlot {
    Blocking(SyncSender<CallResult>),
    #[cfg(feature = "async")]
    Async(tokio::sync::oneshot::Sender<CallResult>),
}

impl ResultSlot {
    fn fulfil(self, result: CallResult) {
        // A receiver that is gone gave up on the call; nothing to do.
        match self {
            ResultSlot::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
            #[cfg(feature = "async")]
            ResultSlot::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// A call waiting for its response.
pub(crate) struct PendingCall {
    pub(crate) service: String,
    pub(crate) command_id: u32,
    pub(crate) started: Instant,
    slot: ResultSlot,
}

struct Table {
    calls: HashMap<u32, PendingCall>,
    next_tag: u32,
    closed: Option<String>,
}

/// Tag allocation and the tag → pending call map.
///
/// Every mutation goes through one lock, so a response, a timeout and a
/// connection failure racing for the same tag resolve it exactly once: the
/// first to remove the entry owns the outcome.
pub(crate) struct PendingTable {
    inner: Mutex<Table>,
    max_pending: usize,
}

impl PendingTable {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self::starting_at(0, max_pending)
    }

    /// Table whose first allocated tag follows `last_tag`.
    pub(crate) fn starting_at(last_tag: u32, max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Table {
                calls: HashMap::new(),
                next_tag: last_tag,
                closed: None,
            }),
            max_pending: max_pending.max(1),
        }
    }

    /// Allocate a tag and record the call. Fails once the table is closed.
    ///
    /// Tag 0 is never handed out. After wrapping, tags still in flight are
    /// skipped.
    pub(crate) fn register(
        &self,
        service: &str,
        command_id: u32,
        slot: ResultSlot,
    ) -> Result<u32> {
        let mut table = self.inner.lock();
        if let Some(reason) = &table.closed {
            return Err(ScopeError::Disconnected(reason.clone()));
        }
        if table.calls.len() >= self.max_pending {
            return Err(ScopeError::TooManyPending(self.max_pending));
        }

        let tag = loop {
            table.next_tag = table.next_tag.wrapping_add(1);
            let candidate = table.next_tag;
            if candidate != 0 && !table.calls.contains_key(&candidate) {
                break candidate;
            }
        };

        table.calls.insert(
            tag,
            PendingCall {
                service: service.to_string(),
                command_id,
                started: Instant::now(),
                slot,
            },
        );
        trace!(tag, service, command_id, "registered pending call");
        Ok(tag)
    }

    /// Resolve the call matching `frame.tag`. Hands the frame back when no
    /// call is waiting for it (unknown or already timed out).
    pub(crate) fn complete(&self, frame: Frame) -> std::result::Result<Duration, Frame> {
        let call = self.inner.lock().calls.remove(&frame.tag);
        match call {
            Some(call) => {
                let elapsed = call.started.elapsed();
                call.slot.fulfil(Ok(frame));
                Ok(elapsed)
            }
            None => Err(frame),
        }
    }

    /// Remove a call without resolving it. `None` means someone else got
    /// there first and the outcome is already in the slot.
    pub(crate) fn cancel(&self, tag: u32) -> Option<PendingCall> {
        self.inner.lock().calls.remove(&tag)
    }

    /// Close the table and fail every waiting call with `Disconnected`.
    /// Returns how many calls were failed.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.inner.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.calls.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            call.slot
                .fulfil(Err(ScopeError::Disconnected(reason.to_string())));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Arc;

    use stp_frame::Status;

    use super::*;

    fn slot() -> (ResultSlot, Receiver<CallResult>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (ResultSlot::Blocking(tx), rx)
    }

    #[test]
    fn tags_start_at_one_and_increase() {
        let table = PendingTable::new(16);
        let (a, _ra) = slot();
        let (b, _rb) = slot();
        assert_eq!(table.register("exec", 1, a).unwrap(), 1);
        assert_eq!(table.register("exec", 1, b).unwrap(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn wrap_skips_zero_and_in_flight_tags() {
        let table = PendingTable::starting_at(u32::MAX - 2, 16);
        let (s1, _r1) = slot();
        let (s2, _r2) = slot();
        assert_eq!(table.register("exec", 1, s1).unwrap(), u32::MAX - 1);
        assert_eq!(table.register("exec", 1, s2).unwrap(), u32::MAX);

        // Force the counter back so the next candidates are in flight.
        table.inner.lock().next_tag = u32::MAX - 2;
        let (s3, _r3) = slot();
        assert_eq!(table.register("exec", 1, s3).unwrap(), 1);
    }

    #[test]
    fn complete_delivers_to_matching_slot_only() {
        let table = PendingTable::new(16);
        let (s1, r1) = slot();
        let (s2, r2) = slot();
        let t1 = table.register("exec", 1, s1).unwrap();
        let t2 = table.register("exec", 1, s2).unwrap();

        let reply = Frame::new("exec", 1, t2, Status::Ok, "second");
        assert!(table.complete(reply).is_ok());

        assert_eq!(r2.try_recv().unwrap().unwrap().payload.as_ref(), b"second");
        assert!(r1.try_recv().is_err());
        assert_eq!(table.len(), 1);
        assert!(table.cancel(t1).is_some());
    }

    #[test]
    fn unmatched_response_is_handed_back() {
        let table = PendingTable::new(16);
        let stray = Frame::new("exec", 1, 99, Status::Ok, "late");
        let back = table.complete(stray).unwrap_err();
        assert_eq!(back.tag, 99);
    }

    #[test]
    fn cancel_then_complete_drops_response() {
        let table = PendingTable::new(16);
        let (s, r) = slot();
        let tag = table.register("exec", 1, s).unwrap();
        assert!(table.cancel(tag).is_some());
        assert!(table.complete(Frame::new("exec", 1, tag, Status::Ok, "")).is_err());
        assert!(r.try_recv().is_err());
    }

    #[test]
    fn fail_all_resolves_every_call_and_closes() {
        let table = PendingTable::new(16);
        let receivers: Vec<_> = (0..5)
            .map(|_| {
                let (s, r) = slot();
                table.register("exec", 1, s).unwrap();
                r
            })
            .collect();

        assert_eq!(table.fail_all("peer closed the connection"), 5);
        for rx in receivers {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(ScopeError::Disconnected(reason)) if reason == "peer closed the connection"
            ));
        }

        let (s, _r) = slot();
        assert!(matches!(
            table.register("exec", 1, s),
            Err(ScopeError::Disconnected(_))
        ));
        assert!(table.is_closed());
        assert_eq!(table.fail_all("again"), 0);
    }

    #[test]
    fn pending_limit_enforced() {
        let table = PendingTable::new(2);
        let (a, _ra) = slot();
        let (b, _rb) = slot();
        let (c, _rc) = slot();
        table.register("exec", 1, a).unwrap();
        table.register("exec", 1, b).unwrap();
        assert!(matches!(
            table.register("exec", 1, c),
            Err(ScopeError::TooManyPending(2))
        ));
    }

    #[test]
    fn concurrent_registration_yields_unique_tags() {
        let table = Arc::new(PendingTable::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| {
                            let (tx, _rx) = mpsc::sync_channel(1);
                            table
                                .register("exec", 1, ResultSlot::Blocking(tx))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut tags: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 1600);
    }
}
