//! Free-space queries for the archive preflight.

use std::io;
use std::path::Path;

/// Source of "bytes available on the volume holding `path`".
pub trait SpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the kernel via `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

/// Reports a constant amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}
