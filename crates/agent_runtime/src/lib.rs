//! Shared agent plumbing: error taxonomy, polling runtime, bounded store
//! retries, scoped workdirs, and object-path slugs.

mod error;
mod poller;
mod retry;
mod slug;
mod storage_setup;
mod workdir;

pub use error::{ErrorKind, WorkflowError};
pub use poller::{Poller, PollerConfig, PollingStatus, ProjectWorker};
pub use retry::{retry_transient, STORE_RETRY_ATTEMPTS, STORE_RETRY_DELAY};
pub use slug::slugify;
pub use storage_setup::build_storage;
pub use workdir::Workdir;
