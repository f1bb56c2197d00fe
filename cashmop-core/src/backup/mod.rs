//! Snapshot lifecycle: create, validate, restore and prune
//!
//! The entry points are methods on [`crate::Store`]; this module holds the
//! pieces they are built from.

pub mod manager;
pub mod naming;
pub mod retention;
pub mod space;

pub use manager::BackupSnapshot;
pub use naming::SnapshotKind;
pub use retention::{CleanupReport, RetentionPolicy, SnapshotEntry};
pub use space::{FsSpaceProbe, SpaceCheck, SpaceProbe, StaticSpaceProbe};
