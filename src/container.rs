//! Ordered file listings of a directory tree.
//!
//! A [`Container`] is the schema both ends of a patch agree on: the
//! relative paths, sizes, and modes of the regular files under a root,
//! in a deterministic order. Within each directory, entries are
//! visited sorted by file name, so block-index assignment is stable
//! across runs for a given filesystem state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{BoosterError, Result};
use crate::fileset::FileSet;

/// Verdict of a [`PathFilter`] for one walk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Include the entry (files only).
    Keep,
    /// Skip the entry; for directories, prune the whole subtree.
    Ignore,
    /// Walk into the directory without listing it.
    Descend,
}

/// Predicate over relative paths consulted during the walk.
pub trait PathFilter {
    /// Judge an entry by its relative path.
    fn check(&self, relative: &str, is_dir: bool) -> FilterResult;
}

/// Keeps every file and descends into every directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl PathFilter for KeepAll {
    fn check(&self, _relative: &str, is_dir: bool) -> FilterResult {
        if is_dir {
            FilterResult::Descend
        } else {
            FilterResult::Keep
        }
    }
}

/// Keeps only files present in an accept list; directories absent from
/// the list are pruned, so the list must contain every ancestor of a
/// kept file.
#[derive(Debug)]
pub struct AcceptListFilter<'a> {
    accept: &'a FileSet,
}

impl<'a> AcceptListFilter<'a> {
    /// Build a filter over the given set.
    #[must_use]
    pub fn new(accept: &'a FileSet) -> Self {
        Self { accept }
    }
}

impl PathFilter for AcceptListFilter<'_> {
    fn check(&self, relative: &str, is_dir: bool) -> FilterResult {
        if !self.accept.present(relative) {
            return FilterResult::Ignore;
        }
        if is_dir {
            FilterResult::Descend
        } else {
            FilterResult::Keep
        }
    }
}

/// One regular file of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the container root, forward slashes.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
}

/// Ordered sequence of file entries under one root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    entries: Vec<FileEntry>,
}

impl Container {
    /// Walk `root` with `filter`, producing the ordered listing.
    ///
    /// # Errors
    ///
    /// Fails on unreadable directories or non-UTF-8 paths.
    pub fn walk(root: &Path, filter: &dyn PathFilter) -> Result<Self> {
        let mut entries = Vec::new();
        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();

        while let Some(item) = walker.next() {
            let item = item.map_err(|source| BoosterError::Walk {
                path: root.to_path_buf(),
                source,
            })?;
            let relative = relative_name(root, item.path())?;
            let is_dir = item.file_type().is_dir();

            match filter.check(&relative, is_dir) {
                FilterResult::Ignore => {
                    if is_dir {
                        walker.skip_current_dir();
                    }
                }
                FilterResult::Descend => {}
                FilterResult::Keep => {
                    if !item.file_type().is_file() {
                        continue;
                    }
                    let meta = item.metadata().map_err(|source| BoosterError::Walk {
                        path: root.to_path_buf(),
                        source,
                    })?;
                    entries.push(FileEntry {
                        path: relative,
                        size: meta.len(),
                        mode: mode_of(&meta),
                    });
                }
            }
        }

        Ok(Self { entries })
    }

    /// The file entries in walk order.
    #[must_use]
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the container holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all file sizes: the length of the container's
    /// concatenated byte stream.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Number of protocol blocks covering the concatenated stream.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.total_size()
            .div_ceil(crate::signature::BLOCK_SIZE as u64)
    }
}

/// Relative path of `path` under `root` with forward slashes.
fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BoosterError::NonUtf8Path(path.to_path_buf()))?;
    let name = relative
        .to_str()
        .ok_or_else(|| BoosterError::NonUtf8Path(path.to_path_buf()))?;
    Ok(name.replace('\\', "/"))
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Convenience: absolute path of an entry under a root.
pub(crate) fn entry_path(root: &Path, entry: &FileEntry) -> PathBuf {
    root.join(&entry.path)
}
