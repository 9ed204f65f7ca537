//! Persistent speculative memory: crash consistency for command-driven
//! state, without decorating the application's data structures.
//!
//! The embedder hands in a pure "consume" function that interprets opaque
//! command records, and appends records to a command ring living on
//! persistent memory. A consumer process, forked at [`Psm::init`],
//! replays each record against a shadow of the producer's address space
//! while an instrumentation engine routes every store it executes through a
//! byte-granularity undo log. After a crash, an external checkpoint service
//! resurrects the consumer from its initial image; the undo log rolls back
//! any partial replay, the shadowed regions are re-mapped from their PM
//! image files, and the producer replays whatever the recovered ring tail
//! has not covered.
//!
//! ```no_run
//! use psm::{ConsumeFn, Psm, PsmConfig, PsmMode};
//!
//! fn apply(record: &[u8]) -> usize {
//!     // First byte is the opcode (never zero), second the length.
//!     record[1] as usize
//! }
//!
//! let mut psm = Psm::init(PsmConfig {
//!     mode: PsmMode::NoPersist,
//!     pm_path: "/mnt/pmem0/app".into(),
//!     pin_core: None,
//!     consume: ConsumeFn::Bytes(apply),
//!     checkpointer: None,
//!     service_path: None,
//!     imgs_dir: None,
//! })
//! .unwrap();
//!
//! psm.push(&[0x01, 2]);
//! psm.commit(true);
//! ```
//!
//! The three durability modes:
//!
//! * [`PsmMode::NoPersist`]: the ring and the replay loop with no
//!   durability machinery; a baseline.
//! * [`PsmMode::Undo`]: instrumented replay with block-granularity undo
//!   logging; the mode this crate exists for.
//! * [`PsmMode::Checkpoint`]: a process checkpoint per commit instead of
//!   undo logging.
//!
//! The dynamic binary instrumentation engine and the process-checkpoint
//! service are collaborators, not part of this crate: the engine drives
//! [`instrument::Instrumentation`] and inlines the fast-path check
//! described by [`undo::FastPathSpec`]; the service is reached through the
//! [`chkpt::Checkpointer`] trait.

pub mod chkpt;
pub mod config;
mod consumer;
pub mod error;
pub mod instrument;
pub mod pm;
pub mod producer;
pub mod ranges;
pub mod region;
pub mod ring;
pub mod undo;

pub use chkpt::{CheckpointOutcome, Checkpointer, NoopCheckpointer};
pub use config::{ConsumeFn, PsmConfig, PsmMode, SgArray, SGA_MAX_SEGS};
pub use error::InitError;
pub use producer::Psm;
