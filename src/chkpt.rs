//! The process-checkpoint primitive the control loop builds on.
//!
//! The library never speaks to a checkpoint service itself; the embedder
//! supplies a [`Checkpointer`] wired to one (CRIU or equivalent). The
//! contract folds the recovery landing point into a return value: a process
//! image captured by [`Checkpointer::take_initial_checkpoint`] must, when
//! later restored by the external service, resume as if
//! [`Checkpointer::set_recovery_point`] had just returned
//! [`CheckpointOutcome::Restored`].

use nix::errno::Errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Normal startup; no prior image was restored.
    FirstTime,
    /// This process is a resurrected checkpoint image; recovery is needed.
    Restored,
}

pub trait Checkpointer {
    /// Establishes the point control returns to after a restore. Called once
    /// in the foreground before the consumer is forked.
    fn set_recovery_point(&mut self) -> Result<CheckpointOutcome, Errno>;

    /// Captures the calling process (the freshly forked consumer, before any
    /// instrumentation is live) as the image restores resurrect. The
    /// implementation typically detaches the process from its terminal and
    /// dumps into `initial_chkpt/` inside the PM directory.
    fn take_initial_checkpoint(&mut self) -> Result<(), Errno>;

    /// Commit boundary for checkpoint mode: captures an incremental image in
    /// place of an undo-log commit. Returns [`CheckpointOutcome::Restored`]
    /// on the resumed path of a restored image.
    fn checkpoint_commit(&mut self) -> Result<CheckpointOutcome, Errno>;
}

/// Checkpointer for runs that don't need one (`NoPersist` mode, tests):
/// every startup is a first start and commits are no-ops.
#[derive(Debug, Default)]
pub struct NoopCheckpointer;

impl Checkpointer for NoopCheckpointer {
    fn set_recovery_point(&mut self) -> Result<CheckpointOutcome, Errno> {
        Ok(CheckpointOutcome::FirstTime)
    }

    fn take_initial_checkpoint(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn checkpoint_commit(&mut self) -> Result<CheckpointOutcome, Errno> {
        Ok(CheckpointOutcome::FirstTime)
    }
}
