//! Patch stream framing, creation, and application.
//!
//! A patch carries everything needed to turn one directory tree into
//! another: the target and source container manifests, followed by the
//! delta instruction stream compressed with Brotli at quality 7 —
//! higher levels stop improving ratio on this payload while costing
//! CPU. Application is staged: output lands in a scratch directory and
//! is committed atomically, so a failed apply leaves the tree alone.

use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::container::{Container, FileEntry, PathFilter};
use crate::delta::{create_delta, Operation};
use crate::error::{BoosterError, Result};
use crate::pool::{copy_block_range, ContainerReader, FsPool};
use crate::signature::{create_signature, BLOCK_SIZE};
use crate::stage::StagingDir;

/// Magic bytes opening every patch stream.
pub const PATCH_MAGIC: [u8; 4] = *b"BSTP";

/// Current patch stream version.
pub const PATCH_VERSION: u32 = 1;

/// Marker closing the compressed instruction stream.
const PATCH_SENTINEL: [u8; 8] = *b"BSTP_END";

/// Brotli "plateau" quality for the instruction stream.
const BROTLI_QUALITY: u32 = 7;
const BROTLI_LGWIN: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

/// Upper bound on a serialized container manifest.
const MAX_MANIFEST: u64 = 256 * 1024 * 1024;

/// Compute a patch turning the filtered tree at `old_path` into the
/// filtered tree at `new_path` and write it to `writer`.
///
/// # Errors
///
/// Fails on walk, I/O, or encoding errors; nothing useful is in
/// `writer` afterwards.
pub fn create_patch<W: Write>(
    old_path: &Path,
    old_filter: &dyn PathFilter,
    new_path: &Path,
    new_filter: &dyn PathFilter,
    mut writer: W,
) -> Result<()> {
    let target = Container::walk(old_path, old_filter)?;
    let target_pool = FsPool::new(old_path, target.clone());
    let signature = create_signature(&mut ContainerReader::new(&target_pool))?;

    let source = Container::walk(new_path, new_filter)?;
    let source_pool = FsPool::new(new_path, source.clone());

    debug!(
        target_files = target.len(),
        source_files = source.len(),
        blocks = signature.len(),
        "writing patch"
    );

    writer.write_all(&PATCH_MAGIC)?;
    writer.write_all(&PATCH_VERSION.to_le_bytes())?;
    writer.write_all(&(BLOCK_SIZE as u32).to_le_bytes())?;
    write_manifest(&mut writer, &target)?;
    write_manifest(&mut writer, &source)?;

    let mut compressor =
        brotli::CompressorWriter::new(&mut writer, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
    create_delta(&mut ContainerReader::new(&source_pool), &signature, |op| {
        bincode::serialize_into(&mut compressor, &op)?;
        Ok(())
    })?;
    compressor.write_all(&PATCH_SENTINEL)?;
    compressor.flush()?;
    drop(compressor);

    Ok(())
}

/// Apply a patch stream to `output`: target blocks are read back from
/// `output` itself, new content goes through a staging area under
/// `scratch_parent`, and a clean run commits atomically. Returns the
/// number of bytes read from `patch`.
///
/// # Errors
///
/// Fails on framing, I/O, or commit errors; the staging area is
/// discarded and `output` is left untouched.
pub fn apply<R: Read>(patch: R, output: &Path, scratch_parent: &Path) -> Result<u64> {
    let mut counting = CountingReader::new(patch);

    let mut magic = [0u8; 4];
    counting.read_exact(&mut magic)?;
    if magic != PATCH_MAGIC {
        return Err(BoosterError::PatchFormat("bad magic".to_string()));
    }
    let version = read_u32(&mut counting)?;
    if version != PATCH_VERSION {
        return Err(BoosterError::PatchFormat(format!(
            "unsupported version {version}"
        )));
    }
    let block_size = read_u32(&mut counting)?;
    if block_size as usize != BLOCK_SIZE {
        return Err(BoosterError::PatchFormat(format!(
            "block size {block_size} does not match {BLOCK_SIZE}"
        )));
    }

    let target: Container = read_manifest(&mut counting)?;
    let source: Container = read_manifest(&mut counting)?;

    let target_pool = FsPool::new(output, target.clone());
    let mut stage = StagingDir::new(output, scratch_parent)?;

    {
        let mut splitter = OutputSplitter::new(&mut stage, source.entries());
        let mut decompressor = brotli::Decompressor::new(&mut counting, BROTLI_BUFFER);

        let total = source.total_size();
        let mut produced = 0u64;
        while produced < total {
            let op: Operation = bincode::deserialize_from(&mut decompressor)?;
            produced += match op {
                Operation::Literal(data) => {
                    splitter.write_all(&data)?;
                    data.len() as u64
                }
                Operation::Block(index) => {
                    copy_block_range(&target_pool, index, index, &mut splitter)?
                }
                Operation::BlockRange { start, end } => {
                    copy_block_range(&target_pool, start, end, &mut splitter)?
                }
                Operation::Hash(_) => {
                    return Err(BoosterError::PatchFormat(
                        "reserved instruction in stream".to_string(),
                    ))
                }
            };
        }
        if produced > total {
            return Err(BoosterError::PatchFormat(format!(
                "instructions produced {produced} bytes for a {total}-byte source"
            )));
        }

        let mut sentinel = [0u8; PATCH_SENTINEL.len()];
        decompressor.read_exact(&mut sentinel)?;
        if sentinel != PATCH_SENTINEL {
            return Err(BoosterError::PatchFormat("bad trailer".to_string()));
        }

        splitter.finish()?;
    }

    let kept: FxHashSet<&str> = source.entries().iter().map(|e| e.path.as_str()).collect();
    let removed: Vec<String> = target
        .entries()
        .iter()
        .filter(|e| !kept.contains(e.path.as_str()))
        .map(|e| e.path.clone())
        .collect();

    stage.commit(&removed)?;
    Ok(counting.count())
}

fn write_manifest<W: Write>(writer: &mut W, container: &Container) -> Result<()> {
    let encoded = bincode::serialize(container)?;
    writer.write_all(&(encoded.len() as u64).to_le_bytes())?;
    writer.write_all(&encoded)?;
    Ok(())
}

fn read_manifest<R: Read>(reader: &mut R) -> Result<Container> {
    let len = read_u64(reader)?;
    if len > MAX_MANIFEST {
        return Err(BoosterError::PatchFormat(format!(
            "manifest of {len} bytes exceeds limit"
        )));
    }
    let mut encoded = vec![0u8; len as usize];
    reader.read_exact(&mut encoded)?;
    Ok(bincode::deserialize(&encoded)?)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Counts bytes pulled from the underlying reader.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Splits the reconstructed source stream at file boundaries given by
/// the source container's entry sizes, writing each file into the
/// staging area.
struct OutputSplitter<'a> {
    stage: &'a mut StagingDir,
    entries: &'a [FileEntry],
    next: usize,
    current: Option<BufWriter<std::fs::File>>,
    remaining: u64,
}

impl<'a> OutputSplitter<'a> {
    fn new(stage: &'a mut StagingDir, entries: &'a [FileEntry]) -> Self {
        Self {
            stage,
            entries,
            next: 0,
            current: None,
            remaining: 0,
        }
    }

    /// Open the next entry's staged file; empty entries are
    /// materialized immediately.
    fn advance(&mut self) -> io::Result<bool> {
        while self.next < self.entries.len() {
            let entry = &self.entries[self.next];
            self.next += 1;
            let file = self.stage.writer(entry).map_err(io::Error::other)?;
            if entry.size == 0 {
                continue;
            }
            self.current = Some(BufWriter::new(file));
            self.remaining = entry.size;
            return Ok(true);
        }
        Ok(false)
    }

    /// Materialize any remaining empty entries after the last byte.
    fn finish(&mut self) -> Result<()> {
        if self.current.is_some() || self.advance()? {
            return Err(BoosterError::PatchFormat(
                "instruction stream ended before the source container".to_string(),
            ));
        }
        Ok(())
    }
}

impl Write for OutputSplitter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() && !self.advance()? {
            return Err(io::Error::other("bytes past the end of the source container"));
        }
        let writer = self.current.as_mut().expect("writer opened by advance");
        let n = buf.len().min(self.remaining as usize);
        writer.write_all(&buf[..n])?;
        self.remaining -= n as u64;
        if self.remaining == 0 {
            let mut done = self.current.take().expect("current writer");
            done.flush()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = self.current.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
