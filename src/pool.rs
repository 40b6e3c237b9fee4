//! Byte access to container entries.
//!
//! A [`Pool`] opens any entry of a [`Container`] as a seekable byte
//! stream, as many times as needed. [`ContainerReader`] presents the
//! whole container as one concatenated stream in walk order; that
//! stream is what signatures and deltas are computed over, with block
//! `i` addressing bytes `[i * BLOCK_SIZE, (i + 1) * BLOCK_SIZE)`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::container::{entry_path, Container};
use crate::error::{BoosterError, Result};
use crate::signature::BLOCK_SIZE;

/// Seekable readable stream.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Capability to open container entries by index.
pub trait Pool {
    /// The container this pool serves.
    fn container(&self) -> &Container;

    /// Open entry `index` as a fresh stream positioned at the start.
    ///
    /// # Errors
    ///
    /// Fails if the entry does not exist or cannot be opened.
    fn open(&self, index: usize) -> Result<Box<dyn ReadSeek>>;
}

/// Pool backed by a directory tree.
#[derive(Debug)]
pub struct FsPool {
    root: PathBuf,
    container: Container,
}

impl FsPool {
    /// Serve `container`'s entries from files under `root`.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P, container: Container) -> Self {
        Self {
            root: root.into(),
            container,
        }
    }
}

impl Pool for FsPool {
    fn container(&self) -> &Container {
        &self.container
    }

    fn open(&self, index: usize) -> Result<Box<dyn ReadSeek>> {
        let entry = self
            .container
            .entries()
            .get(index)
            .ok_or_else(|| BoosterError::PatchFormat(format!("no container entry {index}")))?;
        let file = File::open(entry_path(&self.root, entry))?;
        Ok(Box::new(file))
    }
}

/// The container's concatenated byte stream.
pub struct ContainerReader<'a> {
    pool: &'a dyn Pool,
    next: usize,
    current: Option<Box<dyn ReadSeek>>,
}

impl<'a> ContainerReader<'a> {
    /// Start reading the pool's container from its first entry.
    #[must_use]
    pub fn new(pool: &'a dyn Pool) -> Self {
        Self {
            pool,
            next: 0,
            current: None,
        }
    }
}

impl Read for ContainerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                let n = stream.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if self.next >= self.pool.container().len() {
                return Ok(0);
            }
            let stream = self.pool.open(self.next).map_err(io::Error::other)?;
            self.next += 1;
            self.current = Some(stream);
        }
    }
}

/// Copy blocks `start..=end` of the pool's concatenated stream into
/// `out`, crossing entry boundaries as needed. Returns the number of
/// bytes written; the final block of the stream may be short.
///
/// # Errors
///
/// Fails if the range exceeds the container or on I/O errors.
pub fn copy_block_range<W: Write>(
    pool: &dyn Pool,
    start: u64,
    end: u64,
    out: &mut W,
) -> Result<u64> {
    let container = pool.container();
    let blocks = container.block_count();
    if start > end || end >= blocks {
        return Err(BoosterError::BlockOutOfRange { start, end, blocks });
    }

    let byte_start = start * BLOCK_SIZE as u64;
    let byte_end = ((end + 1) * BLOCK_SIZE as u64).min(container.total_size());

    let mut written = 0u64;
    let mut offset = 0u64;
    for (index, entry) in container.entries().iter().enumerate() {
        let entry_end = offset + entry.size;
        if entry_end > byte_start && offset < byte_end {
            let from = byte_start.saturating_sub(offset);
            let to = (byte_end - offset).min(entry.size);
            let mut stream = pool.open(index)?;
            if from > 0 {
                stream.seek(SeekFrom::Start(from))?;
            }
            let copied = io::copy(&mut stream.take(to - from), out)?;
            if copied != to - from {
                return Err(BoosterError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("entry {index} shorter than its manifest size"),
                )));
            }
            written += copied;
        }
        offset = entry_end;
        if offset >= byte_end {
            break;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::KeepAll;
    use std::fs;
    use tempfile::TempDir;

    fn pool_over(files: &[(&str, Vec<u8>)]) -> (TempDir, FsPool) {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let container = Container::walk(dir.path(), &KeepAll).unwrap();
        let pool = FsPool::new(dir.path(), container);
        (dir, pool)
    }

    #[test]
    fn container_reader_concatenates_in_order() {
        let (_dir, pool) = pool_over(&[
            ("b", b"world".to_vec()),
            ("a", b"hello ".to_vec()),
        ]);

        let mut out = Vec::new();
        ContainerReader::new(&pool).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn container_reader_reopenable() {
        let (_dir, pool) = pool_over(&[("a", b"data".to_vec())]);
        for _ in 0..3 {
            let mut out = Vec::new();
            ContainerReader::new(&pool).read_to_end(&mut out).unwrap();
            assert_eq!(out, b"data");
        }
    }

    #[test]
    fn block_range_crosses_entry_boundary() {
        // Two files, each half a block: block 0 spans both.
        let half = BLOCK_SIZE / 2;
        let (_dir, pool) = pool_over(&[
            ("a", vec![1u8; half]),
            ("b", vec![2u8; half]),
        ]);

        let mut out = Vec::new();
        copy_block_range(&pool, 0, 0, &mut out).unwrap();
        assert_eq!(out.len(), BLOCK_SIZE);
        assert_eq!(&out[..half], &vec![1u8; half][..]);
        assert_eq!(&out[half..], &vec![2u8; half][..]);
    }

    #[test]
    fn block_range_short_final_block() {
        let (_dir, pool) = pool_over(&[("a", vec![7u8; BLOCK_SIZE + 10])]);

        let mut out = Vec::new();
        let written = copy_block_range(&pool, 1, 1, &mut out).unwrap();
        assert_eq!(written, 10);
    }

    #[test]
    fn block_range_rejects_out_of_range() {
        let (_dir, pool) = pool_over(&[("a", vec![0u8; BLOCK_SIZE])]);
        let mut out = Vec::new();
        let err = copy_block_range(&pool, 0, 5, &mut out).unwrap_err();
        assert!(matches!(err, BoosterError::BlockOutOfRange { .. }));
    }

    #[test]
    fn block_range_matches_concatenated_stream() {
        let (_dir, pool) = pool_over(&[
            ("a", (0..BLOCK_SIZE).map(|i| (i % 256) as u8).collect()),
            ("b", (0..BLOCK_SIZE * 2).map(|i| (i % 251) as u8).collect()),
        ]);

        let mut whole = Vec::new();
        ContainerReader::new(&pool).read_to_end(&mut whole).unwrap();

        let mut ranged = Vec::new();
        copy_block_range(&pool, 1, 2, &mut ranged).unwrap();
        assert_eq!(ranged, &whole[BLOCK_SIZE..3 * BLOCK_SIZE]);
    }
}
