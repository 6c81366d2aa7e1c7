use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Overloaded: {running} running, {queued} queued")]
pub struct Overloaded {
    pub running: usize,
    pub queued: usize,
}

/// Concurrency budget. Holding a `Slot` is the right to execute; dropping it
/// hands the slot to the oldest waiter.
#[derive(Debug)]
pub struct Slot {
    shared: Option<Arc<Shared>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.hand_over();
        }
    }
}

#[derive(Debug)]
pub enum Ticket {
    Admitted(Slot),
    Queued(QueueTicket),
}

/// A reserved place in the admission queue. The place is taken when the
/// ticket is issued, so waiters are served in arrival order no matter when
/// they start waiting.
#[derive(Debug)]
pub struct QueueTicket {
    shared: Arc<Shared>,
    ticket: u64,
    position: usize,
    granted: oneshot::Receiver<Slot>,
}

impl QueueTicket {
    /// 1-based position at the moment the ticket was issued.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Waits for a slot. Returns `None` if `cancel` fires first, in which case
    /// the queue place is given up without ever holding a slot.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Option<Slot> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = &mut self.granted => slot.ok(),
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        // A slot granted but never received goes back through `Slot::drop`
        // once `granted` is dropped.
        let ticket = self.ticket;
        self.shared
            .state()
            .waiters
            .retain(|waiter| waiter.ticket != ticket);
    }
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<Slot>,
}

#[derive(Debug, Default)]
struct State {
    running: usize,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Shared {
    max_concurrent: usize,
    max_queue_depth: usize,
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Passes a freed slot to the oldest live waiter, or returns it to the
    /// budget when nobody is waiting.
    fn hand_over(self: Arc<Self>) {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop_front() {
            let slot = Slot {
                shared: Some(self.clone()),
            };
            match waiter.grant.send(slot) {
                Ok(()) => return,
                Err(mut slot) => slot.shared = None,
            }
        }
        state.running -= 1;
    }
}

#[derive(Clone, Debug)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize, max_queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent,
                max_queue_depth,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Admits immediately when a slot is free and nobody is waiting, queues
    /// when the queue has room, and fails with [`Overloaded`] otherwise.
    pub fn try_admit(&self) -> Result<Ticket, Overloaded> {
        let mut state = self.shared.state();

        if state.waiters.is_empty() && state.running < self.shared.max_concurrent {
            state.running += 1;
            return Ok(Ticket::Admitted(Slot {
                shared: Some(self.shared.clone()),
            }));
        }

        if state.waiters.len() >= self.shared.max_queue_depth {
            return Err(Overloaded {
                running: state.running,
                queued: state.waiters.len(),
            });
        }

        let (grant, granted) = oneshot::channel();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(Waiter { ticket, grant });

        Ok(Ticket::Queued(QueueTicket {
            shared: self.shared.clone(),
            ticket,
            position: state.waiters.len(),
            granted,
        }))
    }

    pub fn running(&self) -> usize {
        self.shared.state().running
    }

    pub fn queued(&self) -> usize {
        self.shared.state().waiters.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    pub fn max_queue_depth(&self) -> usize {
        self.shared.max_queue_depth
    }
}
