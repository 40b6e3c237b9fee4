//! Staged application of patch output.
//!
//! New file contents are written to a scratch directory first; only a
//! clean [`commit`](StagingDir::commit) moves them into the output
//! tree and deletes files the new listing dropped. Dropping the stage
//! without committing leaves the output tree untouched.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::container::FileEntry;
use crate::error::Result;

/// Scratch area accumulating patch output before an atomic commit.
pub struct StagingDir {
    scratch: TempDir,
    output: PathBuf,
    staged: Vec<FileEntry>,
}

impl StagingDir {
    /// Create a staging area for `output` with scratch space under
    /// `scratch_parent`.
    ///
    /// # Errors
    ///
    /// Fails if the scratch directory cannot be created.
    pub fn new<P: Into<PathBuf>>(output: P, scratch_parent: &Path) -> Result<Self> {
        fs::create_dir_all(scratch_parent)?;
        let scratch = tempfile::Builder::new()
            .prefix("staging")
            .tempdir_in(scratch_parent)?;
        Ok(Self {
            scratch,
            output: output.into(),
            staged: Vec::new(),
        })
    }

    /// Open a staged writer for one output file.
    ///
    /// # Errors
    ///
    /// Fails if the scratch file cannot be created.
    pub fn writer(&mut self, entry: &FileEntry) -> Result<File> {
        let path = self.scratch.path().join(&entry.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        self.staged.push(entry.clone());
        Ok(file)
    }

    /// Move every staged file into the output tree, then delete the
    /// paths in `remove`. Files are moved by rename where possible,
    /// falling back to copy across filesystems.
    ///
    /// # Errors
    ///
    /// Fails on any filesystem error; a failed commit may leave some
    /// files updated, but never truncated or half-written.
    pub fn commit(self, remove: &[String]) -> Result<()> {
        debug!(
            staged = self.staged.len(),
            removed = remove.len(),
            output = %self.output.display(),
            "committing staged files"
        );

        for entry in &self.staged {
            let from = self.scratch.path().join(&entry.path);
            let to = self.output.join(&entry.path);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            move_file(&from, &to)?;
            set_mode(&to, entry.mode)?;
        }

        for path in remove {
            let victim = self.output.join(path);
            match fs::remove_file(&victim) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Rename, falling back to copy-and-delete when the scratch space and
/// the output tree live on different filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
