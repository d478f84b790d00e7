use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use facegate_vision::Frame;

/// Single-slot mailbox between the capture loop and the decision loop.
///
/// `publish` overwrites whatever is waiting, `take_latest` empties the slot.
/// Frames nobody took in time are dropped.
#[derive(Debug, Default)]
pub struct FrameBroadcaster {
    slot: Mutex<Option<Frame>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        let stale = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        if stale.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn take_latest(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames overwritten before anyone took them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::new(image::RgbImage::new(2, 2), seq)
    }

    #[test]
    fn take_twice_returns_some_then_none() {
        let slot = FrameBroadcaster::new();
        slot.publish(frame(1));
        assert_eq!(slot.take_latest().map(|f| f.sequence), Some(1));
        assert!(slot.take_latest().is_none());
    }

    #[test]
    fn latest_publish_wins() {
        let slot = FrameBroadcaster::new();
        for seq in 1..=5 {
            slot.publish(frame(seq));
        }
        assert_eq!(slot.take_latest().map(|f| f.sequence), Some(5));
        assert_eq!(slot.published(), 5);
        assert_eq!(slot.dropped(), 4);
    }

    #[test]
    fn empty_slot_is_none() {
        assert!(FrameBroadcaster::new().take_latest().is_none());
    }

    #[test]
    fn consumer_never_sees_older_frame_than_last_taken() {
        let slot = Arc::new(FrameBroadcaster::new());
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for seq in 1..=2_000 {
                    slot.publish(frame(seq));
                }
            })
        };
        let mut last = 0;
        while !producer.is_finished() {
            if let Some(f) = slot.take_latest() {
                assert!(f.sequence > last);
                last = f.sequence;
            }
        }
        producer.join().unwrap();
        if let Some(f) = slot.take_latest() {
            assert!(f.sequence > last);
            last = f.sequence;
        }
        assert_eq!(last, 2_000);
    }
}
