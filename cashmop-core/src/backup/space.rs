//! Free-space checks before writing a snapshot

use std::fmt;
use std::io;
use std::path::Path;

/// Result of asking whether a snapshot fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    /// More free bytes than required
    Sufficient,
    /// The platform could not tell; callers proceed
    Unknown,
    /// Not enough room
    Insufficient { available: u64 },
}

/// Source of free-space figures for a directory.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Bytes available to this process on the volume holding `dir`.
    fn available_space(&self, dir: &Path) -> io::Result<u64>;
}

/// Asks the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Reports a fixed figure, or an error when `None`.
#[derive(Debug, Clone, Copy)]
pub struct StaticSpaceProbe(pub Option<u64>);

impl SpaceProbe for StaticSpaceProbe {
    fn available_space(&self, _dir: &Path) -> io::Result<u64> {
        self.0
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "free space unknown"))
    }
}

/// Compare free space in `dir` against `required` bytes.
pub fn check_space(probe: &dyn SpaceProbe, dir: &Path, required: u64) -> SpaceCheck {
    match probe.available_space(dir) {
        Ok(available) if available > required => SpaceCheck::Sufficient,
        Ok(available) => SpaceCheck::Insufficient { available },
        Err(e) => {
            tracing::debug!(dir = %dir.display(), "Free space unavailable: {}", e);
            SpaceCheck::Unknown
        }
    }
}
