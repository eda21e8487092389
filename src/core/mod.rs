pub mod engine;
pub mod key_mapper;
pub mod manifest;
pub mod progress;
pub mod state;
pub mod token;

pub use engine::{
    FailureKind, JobFailure, JobPaths, SyncConfig, SyncEngine, SyncReport, UploadStrategy,
};
pub use key_mapper::{composite_key, map_key, KeyPolicy};
pub use manifest::{build_manifest, ManifestEntry, ManifestReader, ManifestStats};
pub use progress::{render_progress_line, ProgressEvent, ProgressReporter};
pub use state::{SyncRecord, SyncStateStore};
pub use token::{Credentials, UploadPolicy, UploadToken};
