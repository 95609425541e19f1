use std::sync::{Arc, Weak};

use crate::context::{ContextId, DeviceContext};
use crate::driver::{CommHandle, LockToken};

/// The contexts a worker multiplexes, as parallel arrays in lock-step.
///
/// Never mutated in place - every add or remove builds a new table. `handles` is handed
/// straight to the wait call.
#[derive(Clone)]
pub(crate) struct ContextTable {
    pub handles: Arc<[CommHandle]>,
    pub contexts: Arc<[Weak<DeviceContext>]>,
    pub locks: Arc<[LockToken]>,
    pub ids: Arc<[ContextId]>,
}

/// What a removed slot held, for releasing.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Evicted {
    pub id: ContextId,
    pub handle: CommHandle,
    pub lock: LockToken,
}

impl Default for ContextTable {
    fn default() -> Self {
        Self {
            handles: Arc::new([]),
            contexts: Arc::new([]),
            locks: Arc::new([]),
            ids: Arc::new([]),
        }
    }
}

impl ContextTable {
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
    pub(crate) fn position(&self, id: ContextId) -> Option<usize> {
        self.ids.iter().position(|this| *this == id)
    }
    /// Upgrade slot `index`, `None` if out of bounds or the context is gone.
    pub(crate) fn live(&self, index: usize) -> Option<Arc<DeviceContext>> {
        self.contexts.get(index).and_then(Weak::upgrade)
    }
    pub(crate) fn iter_live(&self) -> impl Iterator<Item = Arc<DeviceContext>> + '_ {
        self.contexts.iter().filter_map(Weak::upgrade)
    }
    /// Indices whose context has been dropped.
    pub(crate) fn dead(&self) -> Vec<usize> {
        self.contexts
            .iter()
            .enumerate()
            .filter_map(|(index, weak)| (weak.strong_count() == 0).then_some(index))
            .collect()
    }
    /// A new table with `context` appended.
    pub(crate) fn with(&self, context: &Arc<DeviceContext>) -> Self {
        let native = context.native();
        Self {
            handles: self.handles.iter().copied().chain([native.comm]).collect(),
            contexts: self
                .contexts
                .iter()
                .cloned()
                .chain([Arc::downgrade(context)])
                .collect(),
            locks: self.locks.iter().copied().chain([native.lock]).collect(),
            ids: self.ids.iter().copied().chain([context.id()]).collect(),
        }
    }
    /// A new table without the slots in `remove`, and what those slots held.
    pub(crate) fn without(&self, remove: &[usize]) -> (Self, Vec<Evicted>) {
        let keep = |index: &usize| !remove.contains(index);
        let evicted = remove
            .iter()
            .filter(|&&index| index < self.len())
            .map(|&index| Evicted {
                id: self.ids[index],
                handle: self.handles[index],
                lock: self.locks[index],
            })
            .collect();
        let table = Self {
            handles: (0..self.len())
                .filter(keep)
                .map(|i| self.handles[i])
                .collect(),
            contexts: (0..self.len())
                .filter(keep)
                .map(|i| self.contexts[i].clone())
                .collect(),
            locks: (0..self.len()).filter(keep).map(|i| self.locks[i]).collect(),
            ids: (0..self.len()).filter(keep).map(|i| self.ids[i]).collect(),
        };
        (table, evicted)
    }
}
