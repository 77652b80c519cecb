//! Server lifecycle state.
//!
//! A single atomic holds the state; every transition is a compare-and-swap,
//! so concurrent `start`/`stop` callers race on one value and exactly one wins.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed, never started.
    NotStarted = 0,
    /// A `start` call holds the claim.
    Starting = 1,
    Running = 2,
    /// A `stop` call holds the claim.
    Stopping = 3,
    /// Stopped; may be started again.
    Stopped = 4,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotStarted as u8),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn swap_if(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves a stopped (or never started) server into `Starting`.
    /// Returns the state it came from so a failed start can restore it.
    pub fn claim_start(&self) -> Result<LifecycleState, ServerError> {
        loop {
            let current = self.get();
            match current {
                LifecycleState::NotStarted | LifecycleState::Stopped => {
                    if self.swap_if(current, LifecycleState::Starting) {
                        return Ok(current);
                    }
                }
                LifecycleState::Starting => return Err(ServerError::AlreadyStarting),
                LifecycleState::Running => return Err(ServerError::AlreadyRunning),
                LifecycleState::Stopping => return Err(ServerError::AlreadyStopping),
            }
        }
    }

    /// Only a running server can be claimed for stopping.
    pub fn claim_stop(&self) -> bool {
        self.swap_if(LifecycleState::Running, LifecycleState::Stopping)
    }

    /// Completes a claimed transition.
    pub(crate) fn release(&self, to: LifecycleState) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// Like [`claim_start`](Self::claim_start), but the claim is returned
    /// as a guard that puts the previous state back if it is dropped
    /// before [`StartClaim::complete`].
    pub(crate) fn guard_start(&self) -> Result<StartClaim<'_>, ServerError> {
        let previous = self.claim_start()?;
        Ok(StartClaim {
            cell: self,
            previous,
            held: true,
        })
    }
}

/// An in-flight start.
pub(crate) struct StartClaim<'a> {
    cell: &'a StateCell,
    previous: LifecycleState,
    held: bool,
}

impl StartClaim<'_> {
    pub(crate) fn previous(&self) -> LifecycleState {
        self.previous
    }

    pub(crate) fn complete(mut self, to: LifecycleState) {
        self.held = false;
        self.cell.release(to);
    }
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        if self.held {
            self.cell.release(self.previous);
        }
    }
}
