use std::{collections::VecDeque, sync::Arc};

use crate::pipe::PipeInner;

// === Roster === //

/// An ordered list of pipes owned by a drain's scope frame.
///
/// Membership here is one half of a tethering: the other half is the member's
/// `reader` back-reference. The two are maintained together under the
/// source-then-drain lock order, so a member found in a roster always points
/// back at the frame's owner.
#[derive(Default)]
pub(crate) struct Roster {
    members: VecDeque<Arc<PipeInner>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a member whose position does not matter (blockers).
    pub fn push(&mut self, member: Arc<PipeInner>) {
        self.members.push_back(member);
    }

    /// Admits a member at the tail, preserving arrival order (finishers).
    pub fn enqueue(&mut self, member: Arc<PipeInner>) {
        self.members.push_back(member);
    }

    /// Removes and returns the member at the head.
    pub fn dequeue(&mut self) -> Option<Arc<PipeInner>> {
        self.members.pop_front()
    }

    pub fn first(&self) -> Option<&Arc<PipeInner>> {
        self.members.front()
    }

    /// Removes one member by identity, wherever it sits.
    pub fn sever(&mut self, member: &Arc<PipeInner>) -> bool {
        match self.members.iter().position(|m| Arc::ptr_eq(m, member)) {
            Some(at) => {
                self.members.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, member: &Arc<PipeInner>) -> bool {
        self.members.iter().any(|m| Arc::ptr_eq(m, member))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeInner;

    #[test]
    fn delivery_order_is_arrival_order() {
        let mut roster = Roster::new();
        let a = PipeInner::new(false);
        let b = PipeInner::new(false);
        let c = PipeInner::new(false);
        roster.enqueue(a.clone());
        roster.enqueue(b.clone());
        roster.enqueue(c.clone());

        assert!(Arc::ptr_eq(&roster.dequeue().unwrap(), &a));
        assert!(Arc::ptr_eq(&roster.dequeue().unwrap(), &b));
        assert!(Arc::ptr_eq(&roster.dequeue().unwrap(), &c));
        assert!(roster.dequeue().is_none());
    }

    #[test]
    fn sever_removes_by_identity() {
        let mut roster = Roster::new();
        let a = PipeInner::new(false);
        let b = PipeInner::new(false);
        roster.push(a.clone());
        roster.push(b.clone());

        assert!(roster.contains(&b));
        assert!(roster.sever(&b));
        assert!(!roster.contains(&b));
        assert!(!roster.sever(&b));
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(&a));
    }
}
