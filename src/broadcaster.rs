use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// One complete JPEG frame as published by the frame sink.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slot {
    frame: Option<Frame>,
    seq: u64,
    closed: bool,
}

/// Latest-frame hand-off between the capture producer and streaming clients.
///
/// Holds only the most recent frame and a sequence number bumped on every
/// publish. Receivers wake for a newer sequence only, so slow clients skip
/// frames and a client that subscribes late waits for the next publish.
/// Publishing never waits on receivers.
#[derive(Debug, Default)]
pub struct StreamBroadcaster {
    slot: Mutex<Slot>,
    notify: Notify,
    receivers: AtomicUsize,
}

impl StreamBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current frame and wake every waiting receiver.
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn publish(&self, data: Bytes, captured_at: DateTime<Utc>) -> u64 {
        let seq = {
            let mut slot = self.lock();
            slot.seq += 1;
            let seq = slot.seq;
            slot.frame = Some(Frame { data, seq, captured_at });
            seq
        };
        // The slot must be updated before anyone is woken.
        self.notify.notify_waiters();
        seq
    }

    /// Create a receiver that waits for the first frame published after now.
    pub fn subscribe(self: &Arc<Self>) -> FrameReceiver {
        let last_seen = self.lock().seq;
        self.receivers.fetch_add(1, Ordering::Relaxed);
        FrameReceiver {
            shared: Arc::clone(self),
            last_seen,
        }
    }

    /// Wake all receivers and make them return `None` from now on.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn latest(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.lock().seq
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.load(Ordering::Relaxed)
    }
}

/// A streaming client's view of the broadcaster.
#[derive(Debug)]
pub struct FrameReceiver {
    shared: Arc<StreamBroadcaster>,
    last_seen: u64,
}

impl FrameReceiver {
    /// Wait for a frame newer than the last one this receiver returned.
    ///
    /// Returns `None` once the broadcaster has been closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Register interest before checking the slot so a publish that
            // lands between the check and the await still wakes us.
            let notified = self.shared.notify.notified();
            {
                let slot = self.shared.lock();
                if slot.closed {
                    return None;
                }
                if slot.seq > self.last_seen {
                    if let Some(frame) = &slot.frame {
                        self.last_seen = slot.seq;
                        return Some(frame.clone());
                    }
                }
            }
            notified.await;
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.receivers.fetch_sub(1, Ordering::Relaxed);
    }
}
