//! Hand-off from the polling threads to the single consumer thread.
//!
//! Producers [`deliver`](EventSink::deliver) from any thread. The consumer is woken at most
//! once per drain, and pops events one at a time. If the consumer stalls, moves pile up as
//! at most one queued item per contact on each device: later samples are merged into the one
//! not yet consumed. Samples of one contact stay in order, those of different contacts may
//! interleave differently than they arrived.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::ContextId;
use crate::events::{EventSink, PenEvent};

/// Schedules the consumer loop. Called from polling threads.
pub trait ConsumerWaker: Send + Sync {
    fn wake(&self);
}
impl<F> ConsumerWaker for F
where
    F: Fn() + Send + Sync,
{
    fn wake(&self) {
        self();
    }
}

struct Queued {
    seq: u64,
    event: PenEvent,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Queued>,
    /// Per device and pointer, the sequence number of the queued move still open for merging.
    open_moves: HashMap<(ContextId, u32), u64>,
    next_seq: u64,
    /// A wake was issued and the consumer hasn't drained yet.
    wake_pending: bool,
}
impl QueueInner {
    fn push(&mut self, event: PenEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(Queued { seq, event });
        seq
    }
    /// Try folding a move into the device's open one. Hands the event back if it can't.
    fn merge(&mut self, event: PenEvent) -> Result<(), PenEvent> {
        let Some(&seq) = self.open_moves.get(&(event.context, event.pointer_id)) else {
            return Err(event);
        };
        // Open moves are recent, so near the back.
        let Some(open) = self.items.iter_mut().rev().find(|item| item.seq == seq) else {
            return Err(event);
        };
        if open.event.kind != event.kind {
            return Err(event);
        }
        open.event.data.append(&event.data);
        log::trace!(
            "{} merged {} into queued move at {}",
            event.context,
            event.timestamp,
            open.event.timestamp
        );
        Ok(())
    }
}

pub struct DispatchQueue {
    inner: Mutex<QueueInner>,
    waker: Arc<dyn ConsumerWaker>,
}

impl DispatchQueue {
    #[must_use]
    pub fn new(waker: Arc<dyn ConsumerWaker>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            waker,
        })
    }
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Take the oldest event. Consumer thread only.
    ///
    /// Once this returns `None` the next delivery wakes the consumer again.
    pub fn pop(&self) -> Option<PenEvent> {
        let mut inner = self.lock();
        let Some(item) = inner.items.pop_front() else {
            inner.wake_pending = false;
            return None;
        };
        let key = (item.event.context, item.event.pointer_id);
        if inner.open_moves.get(&key) == Some(&item.seq) {
            inner.open_moves.remove(&key);
        }
        Some(item.event)
    }
    /// Pop and process events until empty, each to completion before the next is popped.
    /// The queue isn't locked while `process` runs, so it may deliver more.
    ///
    /// Returns how many were processed.
    pub fn process_pending(&self, mut process: impl FnMut(PenEvent)) -> usize {
        let mut count = 0;
        while let Some(event) = self.pop() {
            process(event);
            count += 1;
        }
        count
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl EventSink for DispatchQueue {
    fn deliver(&self, event: PenEvent) {
        let wake = {
            let mut inner = self.lock();
            if event.kind.is_move() {
                if let Err(event) = inner.merge(event) {
                    let key = (event.context, event.pointer_id);
                    let seq = inner.push(event);
                    inner.open_moves.insert(key, seq);
                }
            } else {
                // Later moves on this device must not jump ahead of this.
                let context = event.context;
                inner.open_moves.retain(|&(open, _), _| open != context);
                inner.push(event);
            }
            !std::mem::replace(&mut inner.wake_pending, true)
        };
        if wake {
            self.waker.wake();
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TargetId;
    use crate::events::{PacketData, PenEventKind};
    use crate::util::Tick;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(context: u32, kind: PenEventKind, t: i32, word: i32) -> PenEvent {
        touch(context, 1, kind, t, word)
    }

    fn touch(context: u32, pointer_id: u32, kind: PenEventKind, t: i32, word: i32) -> PenEvent {
        PenEvent {
            context: ContextId(context),
            target: TargetId(0),
            pointer_id,
            timestamp: Tick(t),
            kind,
            data: PacketData::new([word].into_iter().collect(), 1),
            ticket: None,
        }
    }

    fn queue() -> (Arc<DispatchQueue>, Arc<AtomicUsize>) {
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let queue = DispatchQueue::new(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        (queue, wakes)
    }

    #[test]
    fn stalled_moves_merge_per_device() {
        let (queue, _) = queue();
        for (t, word) in [(1, 10), (2, 20), (3, 30)] {
            queue.deliver(event(1, PenEventKind::InAirPackets, t, word));
        }
        queue.deliver(event(2, PenEventKind::InAirPackets, 4, 40));
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert_eq!(first.context, ContextId(1));
        assert_eq!(first.timestamp, Tick(1));
        assert_eq!(first.data.values(), &[10, 20, 30]);
        assert_eq!(queue.pop().unwrap().data.values(), &[40]);
    }

    #[test]
    fn non_move_closes_coalescing() {
        let (queue, _) = queue();
        queue.deliver(event(1, PenEventKind::Packets, 1, 1));
        queue.deliver(event(1, PenEventKind::Up, 2, 2));
        queue.deliver(event(1, PenEventKind::Packets, 3, 3));
        let kinds: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|e| (e.kind, e.data.values().to_vec()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (PenEventKind::Packets, vec![1]),
                (PenEventKind::Up, vec![2]),
                (PenEventKind::Packets, vec![3]),
            ]
        );
    }

    #[test]
    fn consumed_move_is_not_merged_into() {
        let (queue, _) = queue();
        queue.deliver(event(1, PenEventKind::Packets, 1, 1));
        assert_eq!(queue.pop().unwrap().data.values(), &[1]);
        queue.deliver(event(1, PenEventKind::Packets, 2, 2));
        assert_eq!(queue.pop().unwrap().data.values(), &[2]);
    }

    #[test]
    fn contact_change_starts_new_item() {
        let (queue, _) = queue();
        queue.deliver(event(1, PenEventKind::InAirPackets, 1, 1));
        queue.deliver(event(1, PenEventKind::Packets, 2, 2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn wakes_once_per_drain() {
        let (queue, wakes) = queue();
        queue.deliver(event(1, PenEventKind::Down, 1, 0));
        queue.deliver(event(1, PenEventKind::Up, 2, 0));
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        assert_eq!(queue.process_pending(drop), 2);
        assert!(queue.is_empty());

        queue.deliver(event(1, PenEventKind::Down, 3, 0));
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn each_contact_keeps_its_own_open_move() {
        let (queue, _) = queue();
        for t in 0..1000 {
            let pointer = 1 + u32::try_from(t % 2).unwrap();
            queue.deliver(touch(1, pointer, PenEventKind::Packets, t, t));
        }
        assert_eq!(queue.len(), 2);
        let first = queue.pop().unwrap();
        assert_eq!(first.pointer_id, 1);
        assert_eq!(first.data.packet_count(), 500);
        assert_eq!(&first.data.values()[..3], &[0, 2, 4]);
        let second = queue.pop().unwrap();
        assert_eq!(second.pointer_id, 2);
        assert_eq!(&second.data.values()[..3], &[1, 3, 5]);
    }

    #[test]
    fn non_move_closes_every_contact_on_the_device() {
        let (queue, _) = queue();
        queue.deliver(touch(1, 1, PenEventKind::Packets, 1, 1));
        queue.deliver(touch(1, 2, PenEventKind::Packets, 2, 2));
        queue.deliver(touch(1, 2, PenEventKind::Up, 3, 3));
        queue.deliver(touch(1, 1, PenEventKind::Packets, 4, 4));
        queue.deliver(touch(2, 1, PenEventKind::Packets, 5, 5));
        assert_eq!(queue.len(), 5);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.data.values().to_vec())
            .collect();
        assert_eq!(order, vec![vec![1], vec![2], vec![3], vec![4], vec![5]]);
    }
}
