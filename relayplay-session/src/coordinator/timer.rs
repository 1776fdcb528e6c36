use crate::coordinator::event::CoordinatorEvent;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectionTimeout,
    GraceClose,
}

/// A pending timer firing into its coordinator's queue.
///
/// `cancel` consumes the handle, so a timer is cancelled at most once.
/// Aborting a timer whose task already finished does nothing.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    kind: TimerKind,
    task: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn cancel(self) {
        debug!("Cancelling {:?} timer {}", self.kind, self.id);
        self.task.abort();
    }
}

/// Mints timer ids and spawns the sleeping tasks.
pub(crate) struct TimerWheel {
    next_id: u64,
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl TimerWheel {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { next_id: 0, tx }
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, deadline: Instant) -> TimerHandle {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(CoordinatorEvent::TimerFired(id));
        })
        .abort_handle();

        debug!("Armed {:?} timer {}", kind, id);
        TimerHandle {
            id,
            kind,
            task,
        }
    }
}

/// The two timers a coordinator may hold at once.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    pub(crate) connection: Option<TimerHandle>,
    pub(crate) grace: Option<TimerHandle>,
}

impl Timers {
    pub(crate) fn armed(&self) -> usize {
        usize::from(self.connection.is_some()) + usize::from(self.grace.is_some())
    }

    /// Takes the timer matching a firing, if it is still armed.
    pub(crate) fn take_fired(&mut self, id: TimerId) -> Option<TimerHandle> {
        if self.connection.as_ref().is_some_and(|t| t.id == id) {
            return self.connection.take();
        }
        if self.grace.as_ref().is_some_and(|t| t.id == id) {
            return self.grace.take();
        }
        None
    }

    pub(crate) fn cancel_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_connection(&mut self) {
        if let Some(timer) = self.connection.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        self.cancel_connection();
        self.cancel_grace();
    }
}
