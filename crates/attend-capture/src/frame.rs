//! Frame type and the single-slot latest-frame buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A captured frame: encoded image bytes plus capture metadata.
#[derive(Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    /// Monotonic per-buffer sequence number, starting at 1.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Shared buffer holding only the most recent frame.
///
/// The producer overwrites; readers take an owned copy of the newest
/// frame. Nothing is queued.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Option<Frame>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Frame>> {
        // A panicking producer leaves the slot holding a whole frame or none.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new frame, replacing any unread one. Returns its sequence.
    pub fn publish(&self, data: Vec<u8>) -> u64 {
        self.publish_at(data, Instant::now())
    }

    pub fn publish_at(&self, data: Vec<u8>, captured_at: Instant) -> u64 {
        let mut slot = self.slot();
        let sequence = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = slot.replace(Frame {
            data: data.into(),
            sequence,
            captured_at,
        });
        if replaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        sequence
    }

    /// Owned copy of the newest frame if it is newer than `sequence`.
    pub fn newer_than(&self, sequence: u64) -> Option<Frame> {
        self.slot()
            .as_ref()
            .filter(|f| f.sequence > sequence)
            .cloned()
    }

    /// Owned copy of the newest frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.slot().clone()
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Number of frames overwritten in the slot.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_slot() {
        let slot = LatestFrame::new();
        assert!(slot.latest().is_none());
        assert!(slot.newer_than(0).is_none());
        assert_eq!(slot.published(), 0);
    }

    #[test]
    fn test_only_newest_frame_is_kept() {
        let slot = LatestFrame::new();
        slot.publish(vec![1]);
        slot.publish(vec![2]);
        let seq = slot.publish(vec![3]);

        let frame = slot.latest().unwrap();
        assert_eq!(frame.sequence, seq);
        assert_eq!(&*frame.data, &[3]);
        assert_eq!(slot.published(), 3);
    }

    #[test]
    fn test_newer_than_filters_seen_frames() {
        let slot = LatestFrame::new();
        let seq = slot.publish(vec![7]);
        assert!(slot.newer_than(seq - 1).is_some());
        assert!(slot.newer_than(seq).is_none());

        slot.publish(vec![8]);
        let frame = slot.newer_than(seq).unwrap();
        assert_eq!(&*frame.data, &[8]);
    }

    #[test]
    fn test_snapshot_survives_overwrite() {
        let slot = LatestFrame::new();
        slot.publish(vec![1, 2, 3]);
        let snapshot = slot.latest().unwrap();
        slot.publish(vec![9]);
        assert_eq!(&*snapshot.data, &[1, 2, 3]);
    }

    #[test]
    fn test_concurrent_publish_and_read() {
        let slot = Arc::new(LatestFrame::new());
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    slot.publish(i.to_le_bytes().to_vec());
                }
            })
        };

        let mut last = 0;
        while last < 1000 {
            if let Some(frame) = slot.newer_than(last) {
                assert!(frame.sequence > last);
                // payload always matches its own sequence
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&frame.data);
                assert_eq!(u32::from_le_bytes(bytes) as u64 + 1, frame.sequence);
                last = frame.sequence;
            }
        }
        producer.join().unwrap();
        assert_eq!(slot.published(), 1000);
    }
}
