// ABOUTME: Dump and restore engine module
// ABOUTME: Handles dump directory layout, manifests, progress and both run directions

pub mod dump;
pub mod files;
pub mod manifest;
pub mod progress;
pub mod restore;

pub use dump::Dumper;
pub use files::{FileKind, RestoreFileSet};
pub use manifest::{Manifest, ManifestEntry};
pub use progress::{ProgressReporter, Stats, StatsSnapshot};
pub use restore::Loader;
