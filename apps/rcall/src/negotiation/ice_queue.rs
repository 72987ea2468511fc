use std::collections::VecDeque;

use crate::signaling::IceCandidateDescriptor;

/// What to do with a remote candidate right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceAdmission {
    Forward(IceCandidateDescriptor),
    Queued { pending: usize },
}

/// Holds remote candidates that arrive before any remote description.
/// Order is preserved and duplicates are kept.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidateDescriptor>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(
        &mut self,
        candidate: IceCandidateDescriptor,
        remote_description_set: bool,
    ) -> IceAdmission {
        if remote_description_set {
            return IceAdmission::Forward(candidate);
        }
        self.pending.push_back(candidate);
        IceAdmission::Queued {
            pending: self.pending.len(),
        }
    }

    /// Empties the queue in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidateDescriptor> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidateDescriptor {
        IceCandidateDescriptor::new(format!("candidate:{n}"), Some("0".into()), 0)
    }

    #[test]
    fn queues_until_remote_description() {
        let mut queue = IceCandidateQueue::new();
        assert_eq!(queue.offer(candidate(1), false), IceAdmission::Queued { pending: 1 });
        assert_eq!(queue.offer(candidate(2), false), IceAdmission::Queued { pending: 2 });
        assert_eq!(queue.offer(candidate(3), true), IceAdmission::Forward(candidate(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drains_in_order_exactly_once() {
        let mut queue = IceCandidateQueue::new();
        for n in [1, 2, 3] {
            queue.offer(candidate(n), false);
        }
        assert_eq!(queue.drain(), vec![candidate(1), candidate(2), candidate(3)]);
        assert!(queue.drain().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn keeps_duplicates() {
        let mut queue = IceCandidateQueue::new();
        queue.offer(candidate(7), false);
        queue.offer(candidate(7), false);
        assert_eq!(queue.drain(), vec![candidate(7), candidate(7)]);
    }
}
