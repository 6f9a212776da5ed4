//! Batches of consumed buffers awaiting delivery to a user callback.
//!
//! A stream collects its consumed buffers into a [`NotifyBatch`] while its
//! lock is held, moves the batch out with [`NotifyBatch::take`], unlocks, and
//! then calls the user callback with [`NotifyBatch::as_slice`]. The callback
//! may re-enter the stream (to queue the next buffer, say) without deadlock.
//! Afterwards the emptied batch is handed back with [`NotifyBatch::restore`]
//! so its storage is reused on the next tick.

/// A fixed-capacity, order-preserving batch.
///
/// Pushing past the reserved capacity hands the item back rather than
/// growing; [`reserve`](Self::reserve) is the only operation that allocates.
#[derive(Debug)]
pub struct NotifyBatch<T> {
    items: Vec<T>,
}

impl<T> Default for NotifyBatch<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> NotifyBatch<T> {
    /// Creates a batch with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Ensures room for at least `n` items in total. Call only outside the
    /// real-time path.
    pub fn reserve(&mut self, n: usize) -> Result<(), crate::EngineError> {
        if n > self.items.capacity() {
            self.items.try_reserve_exact(n - self.items.len())?;
        }
        Ok(())
    }

    /// Appends `item`, or returns it if the batch is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() == self.items.capacity() {
            return Err(item);
        }
        self.items.push(item);
        Ok(())
    }

    /// Moves the batch out, leaving an empty one without storage behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Clears `spent` and puts it back if it has more storage than the
    /// current batch. Items already pushed to the current batch are kept.
    pub fn restore(&mut self, mut spent: Self) {
        spent.items.clear();
        if spent.items.capacity() > self.items.capacity() {
            spent.items.append(&mut self.items);
            *self = spent;
        }
    }

    /// Removes every item in delivery order, keeping the storage.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    /// The batched items in delivery order.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Number of batched items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is batched.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` if the next push would be refused.
    pub fn is_full(&self) -> bool {
        self.items.len() == self.items.capacity()
    }

    /// Number of items the batch holds without growing.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_stops_at_capacity() {
        let mut batch = NotifyBatch::with_capacity(2);
        let capacity = batch.capacity();
        for i in 0..capacity {
            assert!(batch.push(i).is_ok());
        }
        assert_eq!(batch.push(99), Err(99));
        assert_eq!(batch.len(), capacity);
    }

    #[test]
    fn test_take_and_restore_keeps_storage() {
        let mut batch = NotifyBatch::with_capacity(8);
        batch.push(1).unwrap();
        batch.push(2).unwrap();
        let ptr = batch.as_slice().as_ptr();

        let taken = batch.take();
        assert!(batch.is_empty());
        assert_eq!(batch.capacity(), 0);
        assert_eq!(taken.as_slice(), &[1, 2]);

        batch.restore(taken);
        assert!(batch.is_empty());
        assert!(batch.capacity() >= 8);
        batch.push(3).unwrap();
        assert_eq!(batch.as_slice().as_ptr(), ptr);
    }

    #[test]
    fn test_restore_preserves_items_pushed_meanwhile() {
        let mut batch = NotifyBatch::with_capacity(4);
        let taken = batch.take();
        batch.reserve(1).unwrap();
        batch.push(7).unwrap();
        batch.restore(taken);
        assert_eq!(batch.as_slice(), &[7]);
    }

    #[test]
    fn test_reserve_grows() {
        let mut batch: NotifyBatch<u8> = NotifyBatch::default();
        batch.reserve(5).unwrap();
        assert!(batch.capacity() >= 5);
        batch.reserve(2).unwrap();
        assert!(batch.capacity() >= 5);
    }
}
