//! Errors surfaced by `Psm::init`. Hot-path operations are infallible by
//! construction; consumer-side failures abort the process and the next
//! startup retries recovery.

use std::fmt;

use nix::errno::Errno;

#[derive(Debug, PartialEq, Eq)]
pub enum InitError {
    /// The configuration is inconsistent (missing checkpointer, empty
    /// paths, ...).
    InvalidConfig(&'static str),
    /// The PM directory is not on a filesystem supporting direct
    /// (`MAP_SYNC`) mappings.
    NotPersistentMemory,
    /// `init` has already run in this process pair.
    AlreadyInitialized,
    /// A syscall failed; `op` names which.
    Os { op: &'static str, errno: Errno },
    /// The recovery handshake with the restored consumer broke down.
    RecoveryProtocol(&'static str),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            InitError::NotPersistentMemory => {
                write!(f, "pm_path does not support MAP_SYNC mappings")
            }
            InitError::AlreadyInitialized => write!(f, "psm is already initialized"),
            InitError::Os { op, errno } => write!(f, "{}: {}", op, errno),
            InitError::RecoveryProtocol(what) => write!(f, "recovery protocol failure: {}", what),
        }
    }
}

impl std::error::Error for InitError {}

/// Most syscall failures in `init` carry their operation name.
pub(crate) fn os_err(op: &'static str) -> impl FnOnce(Errno) -> InitError {
    move |errno| InitError::Os { op, errno }
}
