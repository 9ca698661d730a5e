use std::collections::VecDeque;

/// Bounded FIFO that makes room by discarding its oldest entry.
///
/// Backed by a `VecDeque`. Pushing into a full queue never fails or
/// blocks; the evicted element is handed back so the caller can count it.
#[derive(Debug, Clone)]
pub struct DropOldestQueue<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    /// Creates an empty queue. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `value`, returning the element evicted to make room.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.buf.len() == self.capacity {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(value);
        evicted
    }

    /// Takes the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_under_capacity() {
        let mut q = DropOldestQueue::new(5);
        assert_eq!(q.push(1), None);
        assert_eq!(q.push(2), None);

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut q = DropOldestQueue::new(3);
        let evicted: Vec<_> = (1..=5).filter_map(|i| q.push(i)).collect();

        assert_eq!(evicted, vec![1, 2]);
        assert!(q.is_full());
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut q = DropOldestQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.push("a");
        assert_eq!(q.push("b"), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert!(q.is_empty());
    }
}
