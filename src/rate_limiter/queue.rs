//! # Pending Queue
//!
//! Limiter-owned storage for items waiting to be released.
//!
//! Each accepted item is wrapped in a [`Slot`] keyed by a signed position.
//! FIFO inserts take the next position after the tail, LIFO inserts take the
//! next position before the head, and release always pops the smallest
//! position:
//!
//! ```text
//!     positions:   -2   -1    0    1    2
//!                 [L2] [L1] [F0] [F1] [F2]
//!                  ▲                    ▲
//!           lifo inserts          fifo inserts
//!           grow this way         grow this way
//!
//!     pop_front() always takes the leftmost slot
//! ```
//!
//! Positions are never reused, so a [`Ticket`] stays valid (and unique)
//! until its item leaves the queue. Switching discipline only changes where
//! the *next* insert lands.

use super::config::QueueDiscipline;
use super::executor::TaskId;
use std::collections::BTreeMap;

/// Cancellation handle returned by a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub(crate) limiter: u64,
    pub(crate) position: i64,
}

/// One queued item and the task it is bound for.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) destination: TaskId,
    pub(crate) item: T,
    /// Global insertion counter, independent of discipline.
    pub(crate) sequence: u64,
}

#[derive(Debug)]
pub(crate) struct PendingQueue<T> {
    limiter: u64,
    slots: BTreeMap<i64, Slot<T>>,
    next_back: i64,
    next_front: i64,
    next_sequence: u64,
}

impl<T> PendingQueue<T> {
    pub(crate) fn new(limiter: u64) -> Self {
        Self {
            limiter,
            slots: BTreeMap::new(),
            next_back: 0,
            next_front: -1,
            next_sequence: 0,
        }
    }

    pub(crate) fn push(
        &mut self,
        destination: TaskId,
        item: T,
        discipline: QueueDiscipline,
    ) -> Ticket {
        let position = match discipline {
            QueueDiscipline::Fifo => {
                let p = self.next_back;
                self.next_back += 1;
                p
            }
            QueueDiscipline::Lifo => {
                let p = self.next_front;
                self.next_front -= 1;
                p
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.slots.insert(
            position,
            Slot {
                destination,
                item,
                sequence,
            },
        );

        Ticket {
            limiter: self.limiter,
            position,
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<Slot<T>> {
        self.slots.pop_first().map(|(_, slot)| slot)
    }

    pub(crate) fn remove(&mut self, ticket: &Ticket) -> Option<Slot<T>> {
        if ticket.limiter != self.limiter {
            return None;
        }
        self.slots.remove(&ticket.position)
    }

    pub(crate) fn contains(&self, ticket: &Ticket) -> bool {
        ticket.limiter == self.limiter && self.slots.contains_key(&ticket.position)
    }

    /// Removes every slot in release order.
    pub(crate) fn drain(&mut self) -> Vec<Slot<T>> {
        std::mem::take(&mut self.slots).into_values().collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskId {
        TaskId::from_raw(1)
    }

    fn items(queue: &mut PendingQueue<char>) -> Vec<char> {
        std::iter::from_fn(|| queue.pop_front().map(|s| s.item)).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingQueue::new(1);
        for c in ['a', 'b', 'c'] {
            queue.push(task(), c, QueueDiscipline::Fifo);
        }
        assert_eq!(items(&mut queue), vec!['a', 'b', 'c']);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lifo_order() {
        let mut queue = PendingQueue::new(1);
        for c in ['a', 'b', 'c'] {
            queue.push(task(), c, QueueDiscipline::Lifo);
        }
        assert_eq!(items(&mut queue), vec!['c', 'b', 'a']);
    }

    #[test]
    fn test_switching_discipline_keeps_existing_order() {
        let mut queue = PendingQueue::new(1);
        queue.push(task(), 'a', QueueDiscipline::Fifo);
        queue.push(task(), 'b', QueueDiscipline::Fifo);
        queue.push(task(), 'x', QueueDiscipline::Lifo);
        queue.push(task(), 'c', QueueDiscipline::Fifo);
        queue.push(task(), 'y', QueueDiscipline::Lifo);

        assert_eq!(items(&mut queue), vec!['y', 'x', 'a', 'b', 'c']);
    }

    #[test]
    fn test_remove_by_ticket() {
        let mut queue = PendingQueue::new(7);
        let a = queue.push(task(), 'a', QueueDiscipline::Fifo);
        let b = queue.push(task(), 'b', QueueDiscipline::Fifo);

        assert!(queue.contains(&a));
        assert_eq!(queue.remove(&a).map(|s| s.item), Some('a'));
        assert!(!queue.contains(&a));
        assert!(queue.remove(&a).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&b));
    }

    #[test]
    fn test_foreign_ticket_is_rejected() {
        let mut mine = PendingQueue::new(1);
        let mut theirs = PendingQueue::new(2);
        mine.push(task(), 'a', QueueDiscipline::Fifo);
        let foreign = theirs.push(task(), 'z', QueueDiscipline::Fifo);

        // Same position, different limiter
        assert_eq!(foreign.position, 0);
        assert!(mine.remove(&foreign).is_none());
        assert_eq!(mine.len(), 1);
    }

    #[test]
    fn test_drain_in_release_order_and_sequence() {
        let mut queue = PendingQueue::new(1);
        queue.push(task(), 'a', QueueDiscipline::Fifo);
        queue.push(task(), 'b', QueueDiscipline::Lifo);
        queue.push(task(), 'c', QueueDiscipline::Fifo);

        let drained = queue.drain();
        let order: Vec<char> = drained.iter().map(|s| s.item).collect();
        let sequences: Vec<u64> = drained.iter().map(|s| s.sequence).collect();

        assert_eq!(order, vec!['b', 'a', 'c']);
        assert_eq!(sequences, vec![1, 0, 2]);
        assert!(queue.is_empty());

        // Positions keep advancing after a drain
        let t = queue.push(task(), 'd', QueueDiscipline::Fifo);
        assert_eq!(t.position, 2);
    }
}
