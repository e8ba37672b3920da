use futures::channel::oneshot;
use std::collections::VecDeque;
use std::sync::Arc;

use super::control_block::LockControlBlock;
use super::mode::{LockMode, LockStatus};

/// A queued request together with the channel its acquirer is parked on.
pub(crate) struct Waiter {
    pub(crate) block: Arc<LockControlBlock>,
    pub(crate) sender: oneshot::Sender<Arc<LockControlBlock>>,
}

impl Waiter {
    /// Resolves a parked acquirer whose request failed. The receiver may
    /// already be gone; the block still carries the outcome.
    pub(crate) fn complete(self) {
        let _ = self.sender.send(self.block);
    }
}

/// Granted list and FIFO waiting queue for one resource hash.
#[derive(Default)]
pub(crate) struct ResourceControlBlock {
    pub(crate) granted_mode: Option<LockMode>,
    pub(crate) granted: Vec<Arc<LockControlBlock>>,
    pub(crate) waiting: VecDeque<Waiter>,
}

impl ResourceControlBlock {
    pub(crate) fn granted_mode(&self) -> LockMode {
        self.granted_mode.unwrap_or(LockMode::Free)
    }

    pub(crate) fn has_clients(&self) -> bool {
        !self.granted.is_empty() || !self.waiting.is_empty()
    }

    pub(crate) fn locate(&self, owner: i64, mode: LockMode) -> Option<&Arc<LockControlBlock>> {
        self.granted
            .iter()
            .find(|block| block.owner() == owner && block.mode() == mode)
    }

    pub(crate) fn owner_is_granted(&self, owner: i64) -> bool {
        self.granted.iter().any(|block| block.owner() == owner)
    }

    /// True if every granted block belongs to `owner`.
    pub(crate) fn is_single_owner_granted(&self, owner: i64) -> bool {
        !self.granted.is_empty() && self.granted.iter().all(|block| block.owner() == owner)
    }

    pub(crate) fn can_grant(&self, owner: i64, mode: LockMode) -> bool {
        mode.is_compatible_with(self.granted_mode()) || self.is_single_owner_granted(owner)
    }

    pub(crate) fn add_granted(&mut self, block: Arc<LockControlBlock>) {
        self.granted_mode = Some(block.mode().max(self.granted_mode()));
        self.granted.push(block);
    }

    pub(crate) fn contains_granted(&self, block: &Arc<LockControlBlock>) -> bool {
        self.granted.iter().any(|granted| Arc::ptr_eq(granted, block))
    }

    pub(crate) fn remove_granted(&mut self, block: &Arc<LockControlBlock>) -> bool {
        match self.granted.iter().position(|granted| Arc::ptr_eq(granted, block)) {
            Some(index) => {
                self.granted.remove(index);
                true
            }
            None => false,
        }
    }

    /// Queues a waiter. Upgrade requests go ahead of every plain waiter but
    /// behind upgrades queued earlier.
    pub(crate) fn enqueue(&mut self, waiter: Waiter) {
        if waiter.block.is_upgrade() {
            let index = self
                .waiting
                .iter()
                .position(|queued| !queued.block.is_upgrade())
                .unwrap_or(self.waiting.len());
            self.waiting.insert(index, waiter);
        } else {
            self.waiting.push_back(waiter);
        }
    }

    /// Removes a queued waiter, returning its former queue position.
    pub(crate) fn remove_waiter(&mut self, block: &Arc<LockControlBlock>) -> Option<(usize, Waiter)> {
        let index = self
            .waiting
            .iter()
            .position(|queued| Arc::ptr_eq(&queued.block, block))?;
        self.waiting.remove(index).map(|waiter| (index, waiter))
    }

    /// Recomputes the granted mode and moves every grantable waiter from the
    /// head of the queue to the granted list. Stops at the first waiter that
    /// cannot be granted so later requests cannot overtake it.
    ///
    /// Returned waiters must be completed once the table lock is dropped.
    pub(crate) fn recompute_grantees(&mut self) -> Vec<Waiter> {
        self.granted_mode = self
            .granted
            .iter()
            .map(|block| block.mode())
            .reduce(LockMode::max);

        let mut woken = Vec::new();
        while let Some(head) = self.waiting.front() {
            debug_assert_eq!(head.block.status(), LockStatus::Pending);
            if !self.can_grant(head.block.owner(), head.block.mode()) {
                break;
            }
            if let Some(waiter) = self.waiting.pop_front() {
                waiter.block.grant();
                self.add_granted(Arc::clone(&waiter.block));
                woken.push(waiter);
            }
        }
        woken
    }
}
