//! Relative-path set algebra.
//!
//! A [`FileSet`] collects paths relative to one base directory.
//! `sorted` returns the lexicographic listing and is the only form
//! allowed to feed anything that must be reproducible across runs,
//! such as the diff fingerprint.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::error;

/// Set of file paths relative to one base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    basedir: PathBuf,
    files: BTreeSet<String>,
}

impl FileSet {
    /// Create an empty set anchored at `basedir`.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(basedir: P) -> Self {
        Self {
            basedir: basedir.into(),
            files: BTreeSet::new(),
        }
    }

    /// Create a set with one initial path.
    #[must_use]
    pub fn with<P: Into<PathBuf>>(basedir: P, file: &str) -> Self {
        let mut set = Self::new(basedir);
        set.add(file);
        set
    }

    /// Add a path, assumed relative to the set's base directory.
    pub fn add(&mut self, file: &str) {
        self.files.insert(file.to_string());
    }

    /// True if the path is in the set.
    #[must_use]
    pub fn present(&self, file: &str) -> bool {
        self.files.contains(file)
    }

    /// Number of paths in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if the set holds no paths.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The set's base directory.
    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Lexicographically sorted path listing.
    #[must_use]
    pub fn sorted(&self) -> Vec<String> {
        self.files.iter().cloned().collect()
    }

    /// Run `f` on every path in the set.
    pub fn walk<F: FnMut(&Path, &str)>(&self, mut f: F) {
        for file in &self.files {
            f(&self.basedir, file);
        }
    }

    /// Total size of all files in the set. Stat failures are logged
    /// and counted as zero.
    #[must_use]
    pub fn total_file_size(&self) -> u64 {
        let mut total = 0;
        for file in &self.files {
            match std::fs::metadata(self.basedir.join(file)) {
                Ok(meta) if meta.is_file() => total += meta.len(),
                Ok(_) => {}
                Err(err) => error!(file, %err, "could not stat"),
            }
        }
        total
    }

    /// Reinterpret the set against `base`: paths are stripped of the
    /// prefix leading from `base` to the current base directory.
    /// Paths that do not resolve under `base` are dropped.
    #[must_use]
    pub fn relative<P: AsRef<Path>>(&self, base: P) -> Self {
        let base = base.as_ref();
        let mut result = Self::new(base);
        for file in &self.files {
            let absolute = self.basedir.join(file);
            if let Ok(stripped) = absolute.strip_prefix(base) {
                if let Some(name) = stripped.to_str() {
                    result.add(&name.replace('\\', "/"));
                }
            }
        }
        result
    }
}

/// Union of two sets, anchored at `a`'s base directory.
#[must_use]
pub fn merge(a: &FileSet, b: &FileSet) -> FileSet {
    let mut result = a.clone();
    for file in &b.files {
        result.add(file);
    }
    result
}

/// Difference `a - b`, anchored at `a`'s base directory.
#[must_use]
pub fn minus(a: &FileSet, b: &FileSet) -> FileSet {
    let mut result = FileSet::new(a.basedir.clone());
    for file in &a.files {
        if !b.present(file) {
            result.add(file);
        }
    }
    result
}
