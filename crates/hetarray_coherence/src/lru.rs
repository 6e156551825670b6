//! Per-device LRU queues and the pinned set.

use std::collections::{HashMap, HashSet, VecDeque};

use hetarray_compute::DeviceId;

use crate::array::ArrayId;

/// Arrays owning a buffer at each device, least recently used first.
#[derive(Debug, Default)]
pub(crate) struct LruQueues {
    queues: HashMap<DeviceId, VecDeque<ArrayId>>,
}

impl LruQueues {
    /// Move `id` to the most-recently-used end of `device`'s queue.
    pub fn touch(&mut self, device: DeviceId, id: ArrayId) {
        let queue = self.queues.entry(device).or_default();
        if let Some(pos) = queue.iter().position(|&queued| queued == id) {
            queue.remove(pos);
        }
        queue.push_back(id);
    }

    pub fn remove(&mut self, device: DeviceId, id: ArrayId) {
        if let Some(queue) = self.queues.get_mut(&device) {
            queue.retain(|&queued| queued != id);
        }
    }

    /// Queue contents, least recently used first.
    pub fn snapshot(&self, device: DeviceId) -> Vec<ArrayId> {
        self.queues
            .get(&device)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Arrays that must not be evicted.
///
/// The invocation set covers every argument of the kernel invocation being
/// prepared. Each refresh in progress pins its array and the array's
/// ancestors for its duration.
#[derive(Debug, Default)]
pub(crate) struct PinSet {
    invocation: HashSet<ArrayId>,
    transient: Vec<ArrayId>,
    frames: Vec<(ArrayId, usize)>,
}

impl PinSet {
    pub fn is_pinned(&self, id: ArrayId) -> bool {
        self.invocation.contains(&id) || self.transient.contains(&id)
    }

    /// Whether a refresh of `id` is in progress.
    pub fn in_progress(&self, id: ArrayId) -> bool {
        self.frames.iter().any(|&(active, _)| active == id)
    }

    pub fn enter(&mut self, id: ArrayId, ancestors: &[ArrayId]) {
        self.frames.push((id, self.transient.len()));
        self.transient.push(id);
        self.transient.extend_from_slice(ancestors);
    }

    pub fn leave(&mut self) {
        if let Some((_, len)) = self.frames.pop() {
            self.transient.truncate(len);
        }
    }

    pub fn pin_invocation(&mut self, ids: impl IntoIterator<Item = ArrayId>) {
        self.invocation.extend(ids);
    }

    pub fn has_invocation(&self) -> bool {
        !self.invocation.is_empty()
    }

    pub fn clear_invocation(&mut self) {
        self.invocation.clear();
    }

    pub fn unpin(&mut self, id: ArrayId) {
        self.invocation.remove(&id);
    }
}
