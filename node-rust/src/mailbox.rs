//! Single-slot mailboxes between the network tasks and the control loop.
//!
//! Deliberately capacity 1: backpressure is "is the slot free", not a queue.
//! Two generations of the protocol disagreed on what a full slot means, so
//! the policy is explicit — commands default to `RejectIfFull` (a setpoint
//! is never silently dropped mid-write), status reports default to
//! `OverwriteLatest` (freshness over completeness).

use std::sync::{Mutex, MutexGuard};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxPolicy {
    RejectIfFull,
    OverwriteLatest,
}

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    policy: MailboxPolicy,
}

impl<T> Mailbox<T> {
    pub fn new(policy: MailboxPolicy) -> Self {
        Self {
            slot: Mutex::new(None),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to place a value. Returns `false` only under `RejectIfFull`
    /// with the slot occupied.
    pub fn post(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() && self.policy == MailboxPolicy::RejectIfFull {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_if_full_keeps_first_value() {
        let mb = Mailbox::new(MailboxPolicy::RejectIfFull);
        assert!(mb.post(1));
        assert!(!mb.post(2));
        assert_eq!(mb.take(), Some(1));
        assert!(mb.is_empty());
        assert!(mb.post(2));
    }

    #[test]
    fn overwrite_latest_replaces_unread_value() {
        let mb = Mailbox::new(MailboxPolicy::OverwriteLatest);
        assert!(mb.post(1));
        assert!(mb.post(2));
        assert_eq!(mb.take(), Some(2));
        assert_eq!(mb.take(), None);
    }

    #[test]
    fn clear_empties_the_slot() {
        let mb = Mailbox::new(MailboxPolicy::RejectIfFull);
        mb.post("cmd");
        mb.clear();
        assert!(mb.is_empty());
    }
}
