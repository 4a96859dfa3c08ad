//! Creator library bookkeeping.
//!
//! - [`state`]: the persisted `creators_metadata.json` document and its store
//! - [`details`]: per-creator `details.json`
//! - [`reconciler`]: the deferred-creator state machine against the remote catalog
//! - [`maintenance`]: empty-directory pruning, broken-symlink removal and cover repair

mod details;
mod maintenance;
mod reconciler;
mod state;

pub use details::{CreatorDetails, DETAILS_FILE_NAME};
pub use maintenance::{CleanupReport, clean_library, repair_covers};
pub use reconciler::{LibraryReconciler, ReconcileReport, ReconcilerOptions};
pub use state::{CreatorEntry, CreatorsMetadata, StateError, StateStore};

/// File name of the reconciliation state at the library root.
pub const STATE_FILE_NAME: &str = "creators_metadata.json";
