use std::collections::VecDeque;

/// What a `scan` callback wants done with the element it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Remove,
    Keep,
    Stop,
}

/// FIFO lists per priority level; iteration goes from the highest level
/// down.
#[derive(Debug)]
pub struct PriorityLinkedList<T> {
    levels: Vec<VecDeque<T>>,
    len: usize,
}

impl<T> PriorityLinkedList<T> {
    pub fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels.max(1)).map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }

    fn level(&self, priority: u8) -> usize {
        usize::from(priority).min(self.levels.len() - 1)
    }

    pub fn add_last(&mut self, item: T, priority: u8) {
        let level = self.level(priority);
        self.levels[level].push_back(item);
        self.len += 1;
    }

    pub fn add_first(&mut self, item: T, priority: u8) {
        let level = self.level(priority);
        self.levels[level].push_front(item);
        self.len += 1;
    }

    pub fn remove_first(&mut self) -> Option<T> {
        let item = self
            .levels
            .iter_mut()
            .rev()
            .find_map(|level| level.pop_front())?;
        self.len -= 1;
        Some(item)
    }

    pub fn peek_first(&self) -> Option<&T> {
        self.levels.iter().rev().find_map(|level| level.front())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.levels.iter_mut().for_each(VecDeque::clear);
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.levels.iter().rev().flat_map(|level| level.iter())
    }

    /// Take out every element, highest priority first.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for level in self.levels.iter_mut().rev() {
            out.extend(level.drain(..));
        }
        self.len = 0;
        out
    }

    /// Remove the first element matching `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for level in self.levels.iter_mut().rev() {
            if let Some(pos) = level.iter().position(&mut pred) {
                let item = level.remove(pos);
                if item.is_some() {
                    self.len -= 1;
                }
                return item;
            }
        }
        None
    }

    /// Visit elements in delivery order, removing or stopping as the
    /// callback decides. Removed elements are dropped.
    pub fn scan(&mut self, mut visit: impl FnMut(&T) -> Scan) {
        for level in self.levels.iter_mut().rev() {
            let mut i = 0;
            while i < level.len() {
                match visit(&level[i]) {
                    Scan::Remove => {
                        level.remove(i);
                        self.len -= 1;
                    }
                    Scan::Keep => i += 1,
                    Scan::Stop => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_first_then_fifo() {
        let mut list = PriorityLinkedList::new(10);
        list.add_last("p5", 5);
        list.add_last("p9", 9);
        list.add_last("p1", 1);
        list.add_last("p9b", 9);
        assert_eq!(list.len(), 4);
        assert_eq!(list.remove_first(), Some("p9"));
        assert_eq!(list.remove_first(), Some("p9b"));
        assert_eq!(list.remove_first(), Some("p5"));
        assert_eq!(list.remove_first(), Some("p1"));
        assert!(list.remove_first().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn add_first_goes_to_front_of_its_band() {
        let mut list = PriorityLinkedList::new(10);
        list.add_last(1, 4);
        list.add_last(2, 4);
        list.add_first(3, 4);
        list.add_last(4, 6);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![4, 3, 1, 2]);
    }

    #[test]
    fn scan_removes_keeps_and_stops() {
        let mut list = PriorityLinkedList::new(10);
        for i in 0..6 {
            list.add_last(i, 4);
        }
        list.scan(|&i| match i {
            4 => Scan::Stop,
            i if i % 2 == 0 => Scan::Remove,
            _ => Scan::Keep,
        });
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 3, 4, 5]);
        assert_eq!(list.len(), 4);
        assert_eq!(list.remove_where(|&i| i == 3), Some(3));
        assert_eq!(list.drain_all(), vec![1, 4, 5]);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn out_of_range_priority_is_clamped() {
        let mut list = PriorityLinkedList::new(3);
        list.add_last("low", 0);
        list.add_last("high", 200);
        assert_eq!(list.peek_first(), Some(&"high"));
    }
}
