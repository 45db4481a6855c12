//! Session lifecycle state machine
//!
//! The only session state touched from outside the task queue. Every
//! transition is a short test-and-set under one mutex that is never held
//! across an await point.

use core::fmt;
use std::sync::{Mutex, MutexGuard};

use devmgr_core::{SessionError, SessionResult};

// ----------------------------------------------------------------------------
// Lifecycle States
// ----------------------------------------------------------------------------

/// Where the session is in its open/close cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Closed,
    /// An open call owns the session
    Opening,
    /// Fully open and usable
    Open,
    /// A shutdown is running. `during_open` marks the teardown of a failed
    /// open attempt, which returns to `Opening` rather than `Closed`.
    ShuttingDown { during_open: bool },
}

impl Phase {
    pub fn state_name(&self) -> &'static str {
        match self {
            Phase::Closed => "closed",
            Phase::Opening => "opening",
            Phase::Open => "open",
            Phase::ShuttingDown { .. } => "shutting-down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Outcome of starting a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTicket {
    /// The session had been fully open, so it is registered with the
    /// transport and the on-close observer fires when the shutdown ends
    pub was_open: bool,
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Lifecycle {
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn phase_mut(&self) -> MutexGuard<'_, Phase> {
        self.phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> Phase {
        *self.phase_mut()
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// Claim the session for an open call
    pub fn begin_open(&self) -> SessionResult<()> {
        let mut phase = self.phase_mut();
        match *phase {
            Phase::Closed => {
                *phase = Phase::Opening;
                Ok(())
            }
            _ => Err(SessionError::AlreadyOpen),
        }
    }

    /// Mark a successful open
    pub fn complete_open(&self) {
        let mut phase = self.phase_mut();
        debug_assert_eq!(*phase, Phase::Opening, "open completed from {}", *phase);
        *phase = Phase::Open;
    }

    /// Release the session after a failed open call
    pub fn abandon_open(&self) {
        let mut phase = self.phase_mut();
        debug_assert_eq!(*phase, Phase::Opening, "open abandoned from {}", *phase);
        *phase = Phase::Closed;
    }

    /// Start a shutdown
    ///
    /// Proceeds from `Open`. From `Opening` it proceeds only when
    /// `allow_opening` is set, which the open path uses to clean up after its
    /// own failed attempt. Everything else is already closed.
    pub fn begin_shutdown(&self, allow_opening: bool) -> SessionResult<ShutdownTicket> {
        let mut phase = self.phase_mut();
        match *phase {
            Phase::Open => {
                *phase = Phase::ShuttingDown { during_open: false };
                Ok(ShutdownTicket { was_open: true })
            }
            Phase::Opening if allow_opening => {
                *phase = Phase::ShuttingDown { during_open: true };
                Ok(ShutdownTicket { was_open: false })
            }
            _ => Err(SessionError::AlreadyClosed),
        }
    }

    /// Finish a shutdown, returning whether the on-close observer should fire
    pub fn finish_shutdown(&self) -> bool {
        let mut phase = self.phase_mut();
        match *phase {
            Phase::ShuttingDown { during_open } => {
                *phase = if during_open {
                    Phase::Opening
                } else {
                    Phase::Closed
                };
                !during_open
            }
            other => {
                debug_assert!(false, "shutdown finished from {}", other);
                false
            }
        }
    }
}
