use futures::channel::oneshot;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::mode::LockMode;
use super::wait_for;
use crate::errors::{Result, TxnLockError};

struct PrimeWaiter {
    id: u64,
    mode: LockMode,
    /// `true` on grant, `false` when the lock is closed under the waiter.
    sender: oneshot::Sender<bool>,
}

#[derive(Default)]
struct PrimeState {
    readers: usize,
    writer: bool,
    waiters: VecDeque<PrimeWaiter>,
    closed: bool,
    next_waiter_id: u64,
}

impl PrimeState {
    fn can_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && self.readers == 0,
            _ => false,
        }
    }

    fn take(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.readers += 1,
            LockMode::Exclusive => self.writer = true,
            _ => unreachable!("prime lock is only held shared or exclusive"),
        }
    }

    /// Grants the head waiter and, while the head is a reader, every reader
    /// directly behind it.
    fn wake(&mut self) -> Vec<PrimeWaiter> {
        let mut woken = Vec::new();
        while let Some(head) = self.waiters.front() {
            if !self.can_grant(head.mode) {
                break;
            }
            let mode = head.mode;
            self.take(mode);
            if let Some(waiter) = self.waiters.pop_front() {
                woken.push(waiter);
            }
            if mode == LockMode::Exclusive {
                break;
            }
        }
        woken
    }
}

/// A queued prime-lock request whose outcome has not reached the caller.
/// Dropped while armed, it leaves the queue or hands back a grant that was
/// already sent.
struct PendingPrime<'a> {
    lock: &'a PrimeLock,
    waiter_id: u64,
    mode: LockMode,
    receiver: oneshot::Receiver<bool>,
    armed: bool,
}

impl Drop for PendingPrime<'_> {
    fn drop(&mut self) {
        if !self.armed || self.lock.withdraw(self.waiter_id) {
            return;
        }
        self.receiver.close();
        if let Ok(Some(true)) = self.receiver.try_recv() {
            warn!("Dropped a granted prime lock {:?}; releasing", self.mode);
            let _ = self.lock.release(self.mode);
        }
    }
}

/// Container-wide asynchronous reader/writer lock.
///
/// Requests are served in arrival order: a new request queues behind any
/// existing waiter, so a stream of readers cannot starve a writer.
pub(crate) struct PrimeLock {
    state: Mutex<PrimeState>,
}

impl PrimeLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PrimeState::default()),
        }
    }

    pub(crate) async fn acquire(&self, mode: LockMode, timeout: Duration) -> Result<()> {
        let (waiter_id, receiver) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TxnLockError::LockManagerClosed);
            }
            if state.waiters.is_empty() && state.can_grant(mode) {
                state.take(mode);
                return Ok(());
            }
            if timeout.is_zero() {
                return Err(TxnLockError::TimedOut { timeout });
            }
            let (sender, receiver) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(PrimeWaiter { id, mode, sender });
            (id, receiver)
        };

        let mut pending = PendingPrime {
            lock: self,
            waiter_id,
            mode,
            receiver,
            armed: true,
        };
        let outcome = match wait_for(&mut pending.receiver, timeout).await {
            Some(Ok(true)) => Ok(()),
            Some(Ok(false)) | Some(Err(_)) => Err(TxnLockError::LockManagerClosed),
            None if self.withdraw(waiter_id) => {
                debug!("Prime lock {:?} request timed out after {:?}", mode, timeout);
                Err(TxnLockError::TimedOut { timeout })
            }
            // Resolved concurrently with the timer; the outcome is in flight.
            None => match (&mut pending.receiver).await {
                Ok(true) => Ok(()),
                _ => Err(TxnLockError::LockManagerClosed),
            },
        };
        pending.armed = false;
        outcome
    }

    /// Removes a queued waiter and grants whoever it was holding back.
    /// Returns `false` if the waiter is no longer queued.
    fn withdraw(&self, waiter_id: u64) -> bool {
        let woken = {
            let mut state = self.state.lock();
            let Some(index) = state.waiters.iter().position(|w| w.id == waiter_id) else {
                return false;
            };
            state.waiters.remove(index);
            state.wake()
        };
        self.complete(woken);
        true
    }

    pub(crate) fn release(&self, mode: LockMode) -> Result<()> {
        let woken = {
            let mut state = self.state.lock();
            match mode {
                LockMode::Shared if state.readers > 0 => state.readers -= 1,
                LockMode::Exclusive if state.writer => state.writer = false,
                _ => {
                    return Err(TxnLockError::ReleaseFailed(format!(
                        "prime lock is not held in {:?} mode",
                        mode
                    )));
                }
            }
            state.wake()
        };
        self.complete(woken);
        Ok(())
    }

    /// Hands the lock to woken waiters. A waiter whose acquirer went away
    /// gives its grant straight back.
    fn complete(&self, woken: Vec<PrimeWaiter>) {
        for waiter in woken {
            if waiter.sender.send(true).is_err() {
                let _ = self.release(waiter.mode);
            }
        }
    }

    /// Fails every queued request. Current holders keep the lock and may
    /// still release it.
    pub(crate) fn close(&self) {
        let waiters: Vec<PrimeWaiter> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiters.drain(..).collect()
        };
        for waiter in waiters {
            let _ = waiter.sender.send(false);
        }
    }

    /// `(shared holders, exclusive held, queued waiters)`.
    pub(crate) fn snapshot(&self) -> (usize, bool, usize) {
        let state = self.state.lock();
        (state.readers, state.writer, state.waiters.len())
    }
}
