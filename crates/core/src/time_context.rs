//! Transaction-scoped "current system time".
//!
//! The stack holds one [`TemporalContext`] per nesting level that has
//! modified its system time, on top of a permanent session frame. Levels
//! that never call `set_system_time` never get a frame of their own: reads
//! always see the innermost frame, and writes copy it on first use.
//!
//! The host drives the stack through four lifecycle callbacks, which must
//! fire exactly once per level, innermost first:
//!
//! | event                  | top frame owned by the level | otherwise |
//! |------------------------|------------------------------|-----------|
//! | subtransaction commit  | merged into the parent level | no-op     |
//! | subtransaction abort   | discarded                    | no-op     |
//! | transaction commit     | copied into the session frame| no-op     |
//! | transaction abort      | discarded                    | no-op     |

use tracing::debug;

use crate::{SubTransactionId, Timestamp};

/// How the system time of a level is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTimeMode {
    /// Use the start instant of the current transaction.
    TransactionStart,
    /// Use an explicitly set instant.
    Fixed(Timestamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOwner {
    /// The permanent bottom frame: the last committed state.
    Session,
    Level(SubTransactionId),
}

/// The system-time setting of one nesting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalContext {
    owner: FrameOwner,
    mode: SystemTimeMode,
}

impl TemporalContext {
    pub fn mode(&self) -> SystemTimeMode {
        self.mode
    }

    /// The nesting level owning this frame; `None` for the session frame.
    pub fn level(&self) -> Option<SubTransactionId> {
        match self.owner {
            FrameOwner::Session => None,
            FrameOwner::Level(level) => Some(level),
        }
    }

    /// Resolve this context against the current transaction's start.
    pub fn system_time(&self, transaction_start: Timestamp) -> Timestamp {
        match self.mode {
            SystemTimeMode::TransactionStart => transaction_start,
            SystemTimeMode::Fixed(at) => at,
        }
    }
}

/// Per-session stack of [`TemporalContext`] frames. Never empty.
#[derive(Debug, Clone)]
pub struct TimeContextStack {
    frames: Vec<TemporalContext>,
}

impl Default for TimeContextStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeContextStack {
    pub fn new() -> Self {
        Self {
            frames: vec![TemporalContext {
                owner: FrameOwner::Session,
                mode: SystemTimeMode::TransactionStart,
            }],
        }
    }

    /// The innermost frame, for reading.
    pub fn current(&self) -> &TemporalContext {
        // The session frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    /// The frame owned by `level`, pushing a copy of the innermost frame
    /// first if `level` has none yet.
    pub fn current_mut(&mut self, level: SubTransactionId) -> &mut TemporalContext {
        if self.current().owner != FrameOwner::Level(level) {
            let mut frame = *self.current();
            frame.owner = FrameOwner::Level(level);
            debug!(level = level.0, depth = self.frames.len(), "pushing temporal context");
            self.frames.push(frame);
        }
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Effective system time for the current transaction.
    pub fn system_time(&self, transaction_start: Timestamp) -> Timestamp {
        self.current().system_time(transaction_start)
    }

    /// Override the system time of `level`, or revert it to the transaction
    /// start with `None`.
    pub fn set_system_time(&mut self, level: SubTransactionId, at: Option<Timestamp>) {
        let frame = self.current_mut(level);
        frame.mode = match at {
            Some(at) => SystemTimeMode::Fixed(at),
            None => SystemTimeMode::TransactionStart,
        };
    }

    /// Number of frames, the session frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn on_subtransaction_commit(&mut self, level: SubTransactionId, parent: SubTransactionId) {
        if self.current().owner != FrameOwner::Level(level) {
            return;
        }
        let parent_owns_next = self.frames.len() >= 2
            && self.frames[self.frames.len() - 2].owner == FrameOwner::Level(parent);
        if parent_owns_next {
            if let Some(committed) = self.frames.pop() {
                let top = self.frames.len() - 1;
                self.frames[top].mode = committed.mode;
                debug!(level = level.0, parent = parent.0, "merged temporal context into parent");
            }
        } else {
            // The parent never wrote its own frame: hand this one over
            // rather than overwriting an outer level's state.
            let top = self.frames.len() - 1;
            self.frames[top].owner = FrameOwner::Level(parent);
            debug!(level = level.0, parent = parent.0, "re-tagged temporal context to parent");
        }
    }

    pub fn on_subtransaction_abort(&mut self, level: SubTransactionId) {
        if self.current().owner == FrameOwner::Level(level) {
            self.frames.pop();
            debug!(level = level.0, "discarded temporal context");
        }
    }

    pub fn on_transaction_commit(&mut self) {
        if self.current().owner == FrameOwner::Session {
            return;
        }
        debug_assert_eq!(self.frames.len(), 2, "open subtransaction frames at commit");
        if let Some(committed) = self.frames.pop() {
            self.frames.truncate(1);
            self.frames[0].mode = committed.mode;
            debug!(mode = ?committed.mode, "committed temporal context to session");
        }
    }

    pub fn on_transaction_abort(&mut self) {
        if self.frames.len() > 1 {
            debug_assert_eq!(self.frames.len(), 2, "open subtransaction frames at abort");
            self.frames.truncate(1);
            debug!("discarded transaction temporal context");
        }
    }
}
