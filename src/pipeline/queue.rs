//! FIFO queues of buffers paired with backend handles.
//!
//! Every stream keeps three [`BufferQueue`]s (see [`StreamQueues`]):
//!
//! - `pend`: buffers handed to the backend, oldest first
//! - `reuse`: backend handles with no buffer attached, ready to be refilled
//! - `notify`: consumed buffers waiting for the user callback
//!
//! Storage only grows in [`BufferQueue::prepare_for_sz`], which callers run
//! outside the real-time path. Pushing into a queue whose reserved capacity is
//! exhausted hands the item back instead of growing, so queue traffic inside
//! an audio callback never allocates or frees.

use std::collections::VecDeque;

use crate::backend::NativeBuffer;
use crate::buffer::SharedBuffer;
use crate::EngineError;

/// A user buffer paired with the backend handle carrying its data.
///
/// In a `pend` queue `native` is always set; in a `reuse` pool `original`
/// is always `None`. Sources detach the handle as a pair leaves `pend`, so
/// `notify` entries hold only the buffer.
#[derive(Debug, Clone, Default)]
pub struct QueuePair {
    /// The caller's buffer (shared with the caller).
    pub original: Option<SharedBuffer>,
    /// Engine-owned backend handle.
    pub native: Option<NativeBuffer>,
}

impl QueuePair {
    /// Pairs a buffer with the handle that carries it.
    pub fn new(original: SharedBuffer, native: NativeBuffer) -> Self {
        Self {
            original: Some(original),
            native: Some(native),
        }
    }

    /// An unbound handle for the reuse pool.
    pub fn unbound(native: NativeBuffer) -> Self {
        Self {
            original: None,
            native: Some(native),
        }
    }
}

/// An insertion-ordered queue with explicitly reserved capacity.
///
/// # Example
///
/// ```
/// use pcm_engine::pipeline::BufferQueue;
///
/// let mut queue = BufferQueue::new();
/// queue.prepare_for_sz(2)?;
/// assert!(queue.push_owning("a").is_ok());
/// assert!(queue.push_owning("b").is_ok());
/// assert_eq!(queue.push_owning("c"), Err("c"));
/// assert_eq!(queue.pop_orphaning(), Some("a"));
/// # Ok::<(), pcm_engine::EngineError>(())
/// ```
#[derive(Debug)]
pub struct BufferQueue<T = QueuePair> {
    items: VecDeque<T>,
    reserved: usize,
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferQueue<T> {
    /// Creates an empty queue with no reserved capacity.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            reserved: 0,
        }
    }

    /// Grows storage so the queue can hold at least `n` items.
    ///
    /// Must be called from a non-real-time context whenever the queue's
    /// high-water mark may increase. Never shrinks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if storage cannot grow; the
    /// queue is unchanged.
    pub fn prepare_for_sz(&mut self, n: usize) -> Result<(), EngineError> {
        if n <= self.reserved {
            return Ok(());
        }
        let additional = n - self.items.len();
        self.items
            .try_reserve(additional)
            .map_err(|_| EngineError::AllocationFailure {
                bytes: additional.saturating_mul(std::mem::size_of::<T>()),
            })?;
        self.reserved = n;
        Ok(())
    }

    /// Appends `item`, taking ownership.
    ///
    /// # Errors
    ///
    /// Returns the item back if the reserved capacity is already used up.
    pub fn push_owning(&mut self, item: T) -> Result<(), T> {
        if self.items.len() >= self.reserved {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Removes and returns the oldest item.
    pub fn pop_orphaning(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Moves the oldest item to the back of `other`.
    ///
    /// Returns `false` and leaves both queues untouched if this queue is empty
    /// or `other` has no reserved room.
    pub fn pop_moving_to(&mut self, other: &mut BufferQueue<T>) -> bool {
        debug_assert!(!self.items.is_empty(), "pop_moving_to on an empty queue");
        if self.items.is_empty() || other.items.len() >= other.reserved {
            return false;
        }
        match self.items.pop_front() {
            Some(item) => {
                other.items.push_back(item);
                true
            }
            None => false,
        }
    }

    /// Moves every item to `other`, oldest first, as far as `other` has room.
    /// Returns the number moved.
    pub fn drain_into(&mut self, other: &mut BufferQueue<T>) -> usize {
        let mut moved = 0;
        while !self.items.is_empty() && other.items.len() < other.reserved {
            if !self.pop_moving_to(other) {
                break;
            }
            moved += 1;
        }
        moved
    }

    /// Returns the oldest item.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Returns the oldest item mutably.
    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items the queue can hold without growing.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Removes every item, keeping the reserved storage.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// The `pend` / `reuse` / `notify` triple owned by one stream.
///
/// All three are sized to the same high-water mark, since an item can sit in
/// any one of them.
#[derive(Debug)]
pub struct StreamQueues<T = QueuePair> {
    /// In flight: handed to the backend, not yet consumed.
    pub pend: BufferQueue<T>,
    /// Pooled items awaiting repopulation.
    pub reuse: BufferQueue<T>,
    /// Consumed, awaiting delivery to the user callback.
    pub notify: BufferQueue<T>,
    high_water: usize,
}

impl<T> Default for StreamQueues<T> {
    fn default() -> Self {
        Self {
            pend: BufferQueue::new(),
            reuse: BufferQueue::new(),
            notify: BufferQueue::new(),
            high_water: 0,
        }
    }
}

impl<T> StreamQueues<T> {
    /// Creates three empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the high-water mark of all three queues to at least `n`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if any queue cannot grow.
    /// Queues that already grew keep their larger storage.
    pub fn prepare_for_sz(&mut self, n: usize) -> Result<(), EngineError> {
        if n <= self.high_water {
            return Ok(());
        }
        self.pend.prepare_for_sz(n)?;
        self.reuse.prepare_for_sz(n)?;
        self.notify.prepare_for_sz(n)?;
        self.high_water = n;
        Ok(())
    }

    /// The largest size all three queues are prepared for.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Total items across the three queues.
    pub fn total(&self) -> usize {
        self.pend.len() + self.reuse.len() + self.notify.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PcmBuffer;
    use crate::format::AudioFormat;
    use std::sync::Arc;

    fn pair(id: u32) -> QueuePair {
        let buffer = PcmBuffer::new(AudioFormat::i16(1, 8000), 16).unwrap();
        QueuePair::new(Arc::new(buffer), NativeBuffer(id))
    }

    #[test]
    fn test_push_requires_reserved_capacity() {
        let mut queue = BufferQueue::new();
        assert!(queue.push_owning(pair(1)).is_err());

        queue.prepare_for_sz(1).unwrap();
        assert!(queue.push_owning(pair(1)).is_ok());
        let rejected = queue.push_owning(pair(2)).unwrap_err();
        assert_eq!(rejected.native, Some(NativeBuffer(2)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_then_pop_returns_same_pair() {
        let mut queue = BufferQueue::new();
        queue.prepare_for_sz(4).unwrap();
        let original = pair(7);
        let buffer = original.original.clone().unwrap();
        queue.push_owning(original).unwrap();

        let popped = queue.pop_orphaning().unwrap();
        assert_eq!(popped.native, Some(NativeBuffer(7)));
        assert!(Arc::ptr_eq(popped.original.as_ref().unwrap(), &buffer));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = BufferQueue::new();
        queue.prepare_for_sz(3).unwrap();
        for id in 1..=3 {
            queue.push_owning(pair(id)).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_orphaning())
            .map(|p| p.native.unwrap().0)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_pop_moving_to_respects_destination_capacity() {
        let mut pend = BufferQueue::new();
        let mut reuse = BufferQueue::new();
        pend.prepare_for_sz(2).unwrap();
        pend.push_owning(pair(1)).unwrap();
        pend.push_owning(pair(2)).unwrap();

        assert!(!pend.pop_moving_to(&mut reuse));
        assert_eq!(pend.len(), 2);

        reuse.prepare_for_sz(1).unwrap();
        assert!(pend.pop_moving_to(&mut reuse));
        assert_eq!(reuse.front().unwrap().native, Some(NativeBuffer(1)));
        assert!(!pend.pop_moving_to(&mut reuse));
        assert_eq!(pend.len(), 1);
    }

    #[test]
    fn test_prepare_never_shrinks() {
        let mut queue: BufferQueue<u32> = BufferQueue::new();
        queue.prepare_for_sz(8).unwrap();
        queue.prepare_for_sz(2).unwrap();
        assert_eq!(queue.reserved(), 8);
    }

    #[test]
    fn test_stream_queues_share_high_water() {
        let mut queues: StreamQueues = StreamQueues::new();
        queues.prepare_for_sz(3).unwrap();
        assert_eq!(queues.pend.reserved(), 3);
        assert_eq!(queues.reuse.reserved(), 3);
        assert_eq!(queues.notify.reserved(), 3);

        for id in 0..3 {
            queues.pend.push_owning(pair(id)).unwrap();
        }
        assert_eq!(queues.pend.drain_into(&mut queues.notify), 3);
        assert_eq!(queues.total(), 3);
        assert!(queues.pend.is_empty());
    }
}
