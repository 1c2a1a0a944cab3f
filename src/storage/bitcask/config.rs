use std::path::Path;

use crate::error::Result;
use crate::region::Region;

use super::Bitcask;

/// Options controlling how a store is opened.
#[derive(Debug, Clone)]
pub struct Config {
    pub(super) read_write: bool,
    pub(super) sync_on_put: bool,
    pub(super) max_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self { read_write: true, sync_on_put: false, max_file_size: 2 << 30 }
    }
}

impl Config {
    /// Opens a store at the given directory with these options, drawing its
    /// memory from `region`.
    pub fn open<'r>(self, region: &'r Region, path: impl AsRef<Path>) -> Result<Bitcask<'r>> {
        Bitcask::open(region, path.as_ref(), self)
    }

    /// Whether writes are allowed. A read-only handle serves `get` but fails
    /// `put`, `delete`, and `merge`, and takes no lock on the active file.
    /// Default `true`.
    pub fn read_write(mut self, read_write: bool) -> Self {
        self.read_write = read_write;
        self
    }

    /// Fsync the active file after every `put`. Durable but slow; without it
    /// recent writes ride on the filesystem's own caching. Default `false`.
    pub fn sync_on_put(mut self, sync_on_put: bool) -> Self {
        self.sync_on_put = sync_on_put;
        self
    }

    /// Size at which the active file is sealed and the next one opened.
    /// Also bounds merged files during a merge. Default 2 GiB.
    pub fn max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }
}
