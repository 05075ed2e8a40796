use std::{collections::BTreeMap, time::{Duration, Instant}};

// Handle of a scheduled timer. Ordered by deadline, then by the order timers
// were scheduled in, so timers sharing a deadline fire first-in first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug)]
pub struct TimerQueue<T> {
    timers: BTreeMap<TimerId, T>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {

    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, timer: T) -> TimerId {
        let id = TimerId { deadline, seq: self.next_seq };
        self.next_seq += 1;
        self.timers.insert(id, timer);
        id
    }

    pub fn schedule_in(&mut self, now: Instant, delay: Duration, timer: T) -> TimerId {
        self.schedule(now + delay, timer)
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.timers.remove(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|id| id.deadline)
    }

    // Pops the earliest timer due at or before now.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        match self.timers.first_key_value() {
            Some((id, _)) if id.deadline <= now => self.timers.pop_first(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_deadline_fifo() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(now, "a");
        queue.schedule(now, "b");
        queue.schedule(now, "c");
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_expired(now).map(|(_, t)| t)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_pop_respects_deadline() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule_in(now, Duration::from_secs(5), 2);
        queue.schedule_in(now, Duration::from_secs(1), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.pop_expired(now).is_none());
        assert_eq!(queue.pop_expired(now + Duration::from_secs(2)).map(|(_, t)| t), Some(1));
        assert!(queue.pop_expired(now + Duration::from_secs(2)).is_none());
        assert_eq!(queue.pop_expired(now + Duration::from_secs(5)).map(|(_, t)| t), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let a = queue.schedule(now, 1);
        queue.schedule(now, 2);
        assert_eq!(queue.cancel(a), Some(1));
        assert_eq!(queue.cancel(a), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_expired(now).map(|(_, t)| t), Some(2));
    }
}
