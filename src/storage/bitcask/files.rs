use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::Result;

const DATA_DIR: &str = "data_files";
const HINT_DIR: &str = "hint_files";
const MERGED_DIR: &str = "merged_files";

const DATA_EXT: &str = "bin";
const HINT_EXT: &str = "hint";
const MERGED_EXT: &str = "merge";

/// Identifies a file the keydir can point into: a data file or a merged
/// file, by 1-based ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    Data(u32),
    Merged(u32),
}

/// The three kinds of files a store directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Hint,
    Merged,
}

/// The store's directory layout. Each kind of file lives in its own
/// subdirectory; names are the uppercase 8-hex-digit 1-based ordinal plus
/// the kind's extension. Ordinal 0 is never addressable: it is substituted
/// by 1, so an empty store and a one-file store both write file 1.
pub struct FileSet {
    data_dir: PathBuf,
    hint_dir: PathBuf,
    merged_dir: PathBuf,
    name_re: Regex,
}

impl FileSet {
    /// Establishes the layout under `parent`. The parent and its three
    /// subdirectories are created with mode 0700 when the parent does not
    /// exist; otherwise the layout is assumed present.
    pub fn open(parent: &Path) -> Result<Self> {
        if !parent.exists() {
            let mut builder = DirBuilder::new();
            builder.recursive(true).mode(0o700);
            builder.create(parent.join(DATA_DIR))?;
            builder.create(parent.join(HINT_DIR))?;
            builder.create(parent.join(MERGED_DIR))?;
        }
        let name_re =
            Regex::new(r"^[0-9A-F]{8}\.(bin|hint|merge)$").expect("file name pattern is valid");
        Ok(Self {
            data_dir: parent.join(DATA_DIR),
            hint_dir: parent.join(HINT_DIR),
            merged_dir: parent.join(MERGED_DIR),
            name_re,
        })
    }

    /// Counts the regular files of the given kind, ignoring anything whose
    /// name does not have the ordinal-dot-extension shape.
    pub fn count(&self, kind: FileKind) -> Result<u32> {
        let ext = Self::ext(kind);
        let mut count = 0;
        for entry in fs::read_dir(self.dir(kind))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if self.name_re.captures(name).is_some_and(|c| &c[1] == ext) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn data_path(&self, n: u32) -> PathBuf {
        Self::file_path(&self.data_dir, DATA_EXT, n)
    }

    pub fn hint_path(&self, n: u32) -> PathBuf {
        Self::file_path(&self.hint_dir, HINT_EXT, n)
    }

    pub fn merged_path(&self, n: u32) -> PathBuf {
        Self::file_path(&self.merged_dir, MERGED_EXT, n)
    }

    /// The on-disk path of a keydir file id.
    pub fn path(&self, id: FileId) -> PathBuf {
        match id {
            FileId::Data(n) => self.data_path(n),
            FileId::Merged(n) => self.merged_path(n),
        }
    }

    /// Opens data file `n` for appending and reading, creating it if absent.
    pub fn open_active(&self, n: u32) -> Result<File> {
        let file =
            OpenOptions::new().append(true).read(true).create(true).open(self.data_path(n))?;
        Ok(file)
    }

    /// Opens a file of the given kind for appending, creating it if absent.
    pub fn open_append(&self, kind: FileKind, n: u32) -> Result<File> {
        let path = match kind {
            FileKind::Data => self.data_path(n),
            FileKind::Hint => self.hint_path(n),
            FileKind::Merged => self.merged_path(n),
        };
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(file)
    }

    fn dir(&self, kind: FileKind) -> &Path {
        match kind {
            FileKind::Data => &self.data_dir,
            FileKind::Hint => &self.hint_dir,
            FileKind::Merged => &self.merged_dir,
        }
    }

    fn ext(kind: FileKind) -> &'static str {
        match kind {
            FileKind::Data => DATA_EXT,
            FileKind::Hint => HINT_EXT,
            FileKind::Merged => MERGED_EXT,
        }
    }

    fn file_path(dir: &Path, ext: &str, n: u32) -> PathBuf {
        let n = if n == 0 { 1 } else { n };
        dir.join(format!("{n:08X}.{ext}"))
    }
}
