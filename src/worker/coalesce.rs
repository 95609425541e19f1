//! Single-slot move coalescing on the polling thread.
//!
//! Hardware can emit many move samples per consumer tick. Consecutive moves from the same
//! device and pointer that start within a short window are concatenated into one batch, so
//! dispatch overhead is bounded while every sample is kept, in order.

use crate::context::ContextId;
use crate::events::PacketData;
use crate::util::Tick;

/// A run of move samples for one device and pointer.
#[derive(Debug)]
pub(crate) struct MoveBatch<C> {
    pub key: ContextId,
    pub context: C,
    pub pointer_id: u32,
    /// Timestamp of the first sample. Reported for the whole batch.
    pub start: Tick,
    pub data: PacketData,
}

#[derive(Debug)]
pub(crate) struct MoveCache<C> {
    slot: Option<MoveBatch<C>>,
    window: u32,
}

impl<C> MoveCache<C> {
    pub(crate) fn new(window: u32) -> Self {
        Self { slot: None, window }
    }
    pub(crate) fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
    /// Offer a move sample. Returns the previous batch if this sample couldn't join it;
    /// the sample then starts a fresh batch.
    pub(crate) fn offer(
        &mut self,
        key: ContextId,
        context: C,
        pointer_id: u32,
        timestamp: Tick,
        data: &PacketData,
    ) -> Option<MoveBatch<C>> {
        if let Some(batch) = &mut self.slot {
            if batch.key == key
                && batch.pointer_id == pointer_id
                && timestamp.since(batch.start).unsigned_abs() < self.window
            {
                batch.data.append(data);
                log::trace!("coalesced move p{pointer_id} {timestamp} into {}", batch.start);
                return None;
            }
        }
        self.slot.replace(MoveBatch {
            key,
            context,
            pointer_id,
            start: timestamp,
            data: data.clone(),
        })
    }
    /// Empty the cache.
    pub(crate) fn take(&mut self) -> Option<MoveBatch<C>> {
        self.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: ContextId = ContextId(1);

    fn sample(word: i32) -> PacketData {
        PacketData::new([word, word].into_iter().collect(), 2)
    }

    #[test]
    fn batches_by_window_from_start() {
        let mut cache = MoveCache::new(8);
        let mut batches = Vec::new();
        for t in [0, 3, 6, 10, 20] {
            batches.extend(cache.offer(DEVICE, (), 1, Tick(t), &sample(t)));
        }
        batches.extend(cache.take());

        let starts: Vec<i32> = batches.iter().map(|b| b.start.get()).collect();
        assert_eq!(starts, vec![0, 10, 20]);
        assert_eq!(batches[0].data.values(), &[0, 0, 3, 3, 6, 6]);
        assert_eq!(batches[1].data.values(), &[10, 10]);
        assert_eq!(batches[2].data.values(), &[20, 20]);
        assert!(cache.is_empty());
    }

    #[test]
    fn other_pointer_or_device_flushes() {
        let mut cache = MoveCache::new(8);
        assert!(cache.offer(DEVICE, (), 1, Tick(0), &sample(1)).is_none());
        let flushed = cache.offer(DEVICE, (), 2, Tick(1), &sample(2)).unwrap();
        assert_eq!(flushed.pointer_id, 1);
        let flushed = cache.offer(ContextId(2), (), 2, Tick(2), &sample(3)).unwrap();
        assert_eq!(flushed.key, DEVICE);
        assert_eq!(flushed.pointer_id, 2);
        assert_eq!(cache.take().unwrap().key, ContextId(2));
    }

    #[test]
    fn window_holds_across_wraparound() {
        let mut cache = MoveCache::new(8);
        assert!(cache.offer(DEVICE, (), 1, Tick(i32::MAX - 2), &sample(1)).is_none());
        assert!(cache.offer(DEVICE, (), 1, Tick(i32::MIN + 2), &sample(2)).is_none());
        let batch = cache.take().unwrap();
        assert_eq!(batch.data.packet_count(), 2);
    }
}
