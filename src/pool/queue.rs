//! 等待队列：按优先级排序，同优先级内 FIFO（TaskId 单调递增即入队顺序）

use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::core::TaskId;

#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: BTreeSet<(Reverse<u32>, TaskId)>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: u32, id: TaskId) {
        self.entries.insert((Reverse(priority), id));
    }

    pub fn remove(&mut self, priority: u32, id: TaskId) -> bool {
        self.entries.remove(&(Reverse(priority), id))
    }

    /// 队首：最高优先级中最早入队者
    pub fn head(&self) -> Option<TaskId> {
        self.entries.first().map(|(_, id)| *id)
    }

    pub fn pop_head(&mut self) -> Option<TaskId> {
        self.entries.pop_first().map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new();
        let low_a = TaskId::new();
        let high = TaskId::new();
        let low_b = TaskId::new();
        let high_late = TaskId::new();

        queue.push(1, low_a);
        queue.push(9, high);
        queue.push(1, low_b);
        queue.push(9, high_late);

        assert_eq!(queue.pop_head(), Some(high));
        assert_eq!(queue.pop_head(), Some(high_late));
        assert_eq!(queue.pop_head(), Some(low_a));
        assert_eq!(queue.pop_head(), Some(low_b));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        let a = TaskId::new();
        let b = TaskId::new();
        queue.push(5, a);
        queue.push(5, b);
        assert!(queue.remove(5, a));
        assert!(!queue.remove(5, a));
        assert_eq!(queue.head(), Some(b));
        assert_eq!(queue.len(), 1);
    }
}
