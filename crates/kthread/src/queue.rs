//! Intrusive thread queues.
//!
//! All three queues link threads through the same `elem` field, so a thread
//! is a member of at most one of them. Linking a thread that is already
//! queued panics inside `intrusive-collections`.

use alloc::vec::Vec;

use intrusive_collections::LinkedList;

use crate::config::TieOrder;
use crate::thread::{Priority, ThreadAdapter, ThreadRef, Tick, Tid};

/// Ready threads in non-increasing priority order.
pub(crate) struct ReadyQueue {
    list: LinkedList<ThreadAdapter>,
    order: TieOrder,
}

impl ReadyQueue {
    pub(crate) fn new(order: TieOrder) -> Self {
        Self {
            list: LinkedList::new(ThreadAdapter::new()),
            order,
        }
    }

    /// Inserts `thread` before the first entry it outranks. Equal priorities
    /// are placed according to the configured [`TieOrder`].
    pub(crate) fn push(&mut self, thread: ThreadRef) {
        let prio = thread.priority();
        let order = self.order;
        let mut cursor = self.list.front_mut();
        while cursor.get().map_or(false, |other| match order {
            TieOrder::Fifo => other.priority() >= prio,
            TieOrder::Lifo => other.priority() > prio,
        }) {
            cursor.move_next();
        }
        cursor.insert_before(thread.to_queue());
    }

    pub(crate) fn pop(&mut self) -> Option<ThreadRef> {
        self.list.pop_front().map(ThreadRef::from_queue)
    }

    /// Priority of the thread that would be dispatched next.
    pub(crate) fn front_priority(&self) -> Option<Priority> {
        self.list.front().get().map(|t| t.priority())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Tid, Priority)> {
        self.list.iter().map(|t| (t.tid(), t.priority())).collect()
    }
}

/// Sleeping threads ordered by wakeup tick, ties by non-increasing priority.
pub(crate) struct SleepQueue {
    list: LinkedList<ThreadAdapter>,
}

impl SleepQueue {
    pub(crate) fn new() -> Self {
        Self {
            list: LinkedList::new(ThreadAdapter::new()),
        }
    }

    /// Inserts `thread` keyed on its current wakeup tick.
    pub(crate) fn push(&mut self, thread: ThreadRef) {
        let wakeup = thread.wakeup();
        let prio = thread.priority();
        let mut cursor = self.list.front_mut();
        while cursor.get().map_or(false, |other| {
            other.wakeup() < wakeup || (other.wakeup() == wakeup && other.priority() >= prio)
        }) {
            cursor.move_next();
        }
        cursor.insert_before(thread.to_queue());
    }

    /// Removes the front thread if it is due at `now`. The queue is sorted,
    /// so `None` means nothing else is due either.
    pub(crate) fn pop_due(&mut self, now: Tick) -> Option<ThreadRef> {
        let due = self.list.front().get().map_or(false, |t| t.wakeup() <= now);
        if due {
            self.list.pop_front().map(ThreadRef::from_queue)
        } else {
            None
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Tid, Tick)> {
        self.list.iter().map(|t| (t.tid(), t.wakeup())).collect()
    }
}

/// Dying threads whose pages still have to be returned.
pub(crate) struct DestructionSet {
    list: LinkedList<ThreadAdapter>,
}

impl DestructionSet {
    pub(crate) fn new() -> Self {
        Self {
            list: LinkedList::new(ThreadAdapter::new()),
        }
    }

    pub(crate) fn push(&mut self, thread: ThreadRef) {
        self.list.push_back(thread.to_queue());
    }

    pub(crate) fn pop(&mut self) -> Option<ThreadRef> {
        self.list.pop_front().map(ThreadRef::from_queue)
    }

    pub(crate) fn len(&self) -> usize {
        self.list.iter().count()
    }
}
