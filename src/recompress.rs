//! Transparent gzip recompressibility.
//!
//! A gzip archive is *transparently recompressible* when decompressing
//! it and re-compressing the result with this crate's reference
//! encoder reproduces the original bytes exactly. Such archives can be
//! kept decompressed on disk (where byte-level deltas work well) and
//! re-gzipped later without changing a single bit.
//!
//! The reference encoder is `flate2`'s gzip writer at
//! `Compression::default()`: 10-byte header with zeroed mtime and no
//! file name, XFL/OS bytes as emitted by flate2's default backend,
//! deflate level 6, CRC32 + size trailer. Changing any of these
//! parameters changes the recompressibility verdict and breaks
//! interoperability.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use sha2::{Digest, Sha512};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::error::{BoosterError, Result};
use crate::fileset::FileSet;

/// Name appended to files decompressed by this module. Both sides of a
/// sync must agree on it.
pub const SUFFIX: &str = "_UNGZIPPED_BY_BOOSTER";

/// Name of the patch-cache directory, pruned from every walk here.
pub const CACHE_DIR: &str = "booster";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Hashes everything read through it.
struct TeeReader<R: Read> {
    inner: R,
    digest: Sha512,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// Hashes everything written through it.
struct DigestWriter {
    digest: Sha512,
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.digest.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streaming gzip reader that simultaneously checks recompressibility.
///
/// The chain is `source → tee(h1) → gzip decode → tee(gzip encode →
/// h2) → caller`: reading decompressed bytes drives both digests, and
/// [`finish`](Self::finish) compares them once the stream is done.
pub struct RecompressingReader<R: Read> {
    decoder: GzDecoder<TeeReader<R>>,
    encoder: GzEncoder<DigestWriter>,
}

impl<R: Read> RecompressingReader<R> {
    /// Wrap a gzip byte source.
    #[must_use]
    pub fn new(source: R) -> Self {
        let tee = TeeReader {
            inner: source,
            digest: Sha512::new(),
        };
        Self {
            decoder: GzDecoder::new(tee),
            encoder: GzEncoder::new(
                DigestWriter {
                    digest: Sha512::new(),
                },
                Compression::default(),
            ),
        }
    }

    /// Finalize both digests and report whether re-compression
    /// reproduces the original archive byte-for-byte.
    ///
    /// # Errors
    ///
    /// Fails if draining the source or closing the encoder fails.
    pub fn finish(self) -> io::Result<bool> {
        // The decoder stops at the gzip trailer; pull any remaining
        // source bytes through the input digest so h1 covers the whole
        // archive.
        let mut tee = self.decoder.into_inner();
        io::copy(&mut tee, &mut io::sink())?;
        let original = tee.digest.finalize();

        let recompressed = self.encoder.finish()?.digest.finalize();
        Ok(original == recompressed)
    }
}

impl<R: Read> Read for RecompressingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder.read(buf)?;
        self.encoder.write_all(&buf[..n])?;
        Ok(n)
    }
}

/// Gzip-compress all of `reader` into `writer` with the reference
/// encoder.
///
/// # Errors
///
/// Propagates I/O errors from either side.
pub fn compress<R: Read, W: Write>(reader: &mut R, writer: W) -> Result<()> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(reader, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

/// Gzip-decompress all of `reader` into `writer`.
///
/// # Errors
///
/// Fails if the input is not a gzip stream or on I/O errors.
pub fn decompress<R: Read, W: Write>(reader: R, writer: &mut W) -> Result<()> {
    let mut decoder = GzDecoder::new(reader);
    io::copy(&mut decoder, writer)?;
    Ok(())
}

/// Check the two-byte gzip magic without consuming the reader's
/// position (the reader is rewound afterwards).
///
/// # Errors
///
/// Propagates read/seek errors.
pub fn is_gzip<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut n = 0;
    while n < magic.len() {
        match reader.read(&mut magic[n..])? {
            0 => break,
            m => n += m,
        }
    }
    reader.seek(SeekFrom::Start(0))?;
    Ok(n == magic.len() && magic == GZIP_MAGIC)
}

/// Decompress and re-compress all of `reader`, reporting whether the
/// archive is transparently recompressible.
///
/// # Errors
///
/// Propagates stream errors; "not gzip at all" is an error here, use
/// [`is_gzip`] first.
pub fn recompressible<R: Read>(reader: R) -> io::Result<bool> {
    let mut checker = RecompressingReader::new(reader);
    io::copy(&mut checker, &mut io::sink())?;
    checker.finish()
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn scoped_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| BoosterError::Io(io::Error::other(e)))
}

/// Walk `base` and decompress every recompressible gzip file into a
/// sibling named `<file><SUFFIX>`. The patch-cache directory and
/// already-suffixed files are skipped.
///
/// Returns the decompressed view: for each file the sibling path if
/// one exists, the original path otherwise, plus every ancestor
/// directory so accept-list filters can descend.
///
/// # Errors
///
/// Fails only on walk errors; per-file decompression failures are
/// logged and the original file is kept as-is.
pub fn decompress_walking(base: &Path) -> Result<FileSet> {
    debug!(path = %base.display(), "decompressing archives");

    let mut candidates = Vec::new();
    let mut walker = WalkDir::new(base).min_depth(1).into_iter();
    while let Some(item) = walker.next() {
        let item = item.map_err(|source| BoosterError::Walk {
            path: base.to_path_buf(),
            source,
        })?;
        if item.file_type().is_dir() {
            if item.file_name().to_str() == Some(CACHE_DIR) {
                walker.skip_current_dir();
            }
            continue;
        }
        if !item.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_name(base, item.path()) else {
            return Err(BoosterError::NonUtf8Path(item.path().to_path_buf()));
        };
        if relative.ends_with(SUFFIX) {
            continue;
        }
        candidates.push(relative);
    }

    let pool = scoped_pool(2 * worker_count())?;
    let processed: Vec<String> = pool.install(|| {
        candidates
            .into_par_iter()
            .map(|relative| {
                let sibling = format!("{relative}{SUFFIX}");
                if try_decompress(&base.join(&relative), &base.join(&sibling)) {
                    sibling
                } else {
                    relative
                }
            })
            .collect()
    });

    let mut view = FileSet::new(base);
    for path in processed {
        for ancestor in ancestors_of(&path) {
            view.add(&ancestor);
        }
        view.add(&path);
    }
    Ok(view)
}

/// Attempt to decompress one archive into `destination`. Returns true
/// if a usable decompressed sibling exists afterwards. Failures are
/// logged, partial output is removed, and the original is left alone.
fn try_decompress(source_path: &Path, destination_path: &Path) -> bool {
    if destination_path.exists() {
        return true;
    }

    let source = match File::open(source_path) {
        Ok(f) => f,
        Err(err) => {
            error!(path = %source_path.display(), %err, "could not open for decompression");
            return false;
        }
    };
    let mut source = BufReader::new(source);

    match is_gzip(&mut source) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(err) => {
            error!(path = %source_path.display(), %err, "could not probe archive");
            return false;
        }
    }

    let destination = match File::create(destination_path) {
        Ok(f) => f,
        Err(err) => {
            error!(path = %destination_path.display(), %err, "could not create decompressed sibling");
            return false;
        }
    };

    let mut checker = RecompressingReader::new(source);
    let mut writer = BufWriter::new(destination);
    let copied = io::copy(&mut checker, &mut writer)
        .and_then(|_| writer.flush())
        .and_then(|()| checker.finish());

    match copied {
        Ok(true) => true,
        Ok(false) => {
            // Decompression worked but the archive cannot be rebuilt
            // bit-identically; it must travel compressed.
            remove_logged(destination_path);
            false
        }
        Err(err) => {
            error!(path = %source_path.display(), %err, "error while decompressing");
            remove_logged(destination_path);
            false
        }
    }
}

fn remove_logged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        error!(path = %path.display(), %err, "error while removing");
    }
}

/// Re-gzip every suffix-marked file under `base` whose de-suffixed
/// companion is absent.
///
/// # Errors
///
/// Fails on walk errors, or if at least one file failed to recompress.
pub fn recompress_all_in(base: &Path) -> Result<()> {
    debug!(path = %base.display(), "recompressing archives");

    let mut pending: Vec<(PathBuf, PathBuf)> = Vec::new();
    for item in WalkDir::new(base).min_depth(1) {
        let item = item.map_err(|source| BoosterError::Walk {
            path: base.to_path_buf(),
            source,
        })?;
        if !item.file_type().is_file() {
            continue;
        }
        let Some(name) = item.path().to_str() else {
            return Err(BoosterError::NonUtf8Path(item.path().to_path_buf()));
        };
        let Some(companion) = name.strip_suffix(SUFFIX) else {
            continue;
        };
        let companion = PathBuf::from(companion);
        if companion.exists() {
            continue;
        }
        pending.push((item.path().to_path_buf(), companion));
    }

    let pool = scoped_pool(worker_count())?;
    let failed = pool.install(|| {
        pending
            .par_iter()
            .map(|(source, destination)| {
                if let Err(err) = compress_file(source, destination) {
                    error!(path = %source.display(), %err, "error while recompressing");
                    true
                } else {
                    false
                }
            })
            .filter(|&failed| failed)
            .count()
    });

    if failed > 0 {
        return Err(BoosterError::Recompress {
            path: base.to_path_buf(),
            failed,
        });
    }
    Ok(())
}

fn compress_file(source_path: &Path, destination_path: &Path) -> Result<()> {
    let mut source = BufReader::new(File::open(source_path)?);
    let destination = BufWriter::new(File::create(destination_path)?);
    compress(&mut source, destination)
}

/// Delete every suffix-marked file under `path`, recursively.
///
/// # Errors
///
/// Fails on walk errors or if a file cannot be removed.
pub fn clean(path: &Path) -> Result<()> {
    info!(path = %path.display(), "cleaning decompressed files");

    let mut to_remove = Vec::new();
    for item in WalkDir::new(path).min_depth(1) {
        let item = item.map_err(|source| BoosterError::Walk {
            path: path.to_path_buf(),
            source,
        })?;
        if item.file_type().is_file()
            && item.path().to_str().is_some_and(|p| p.ends_with(SUFFIX))
        {
            to_remove.push(item.path().to_path_buf());
        }
    }

    for file in to_remove {
        fs::remove_file(&file)?;
    }
    Ok(())
}

fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    Some(relative.to_str()?.replace('\\', "/"))
}

fn ancestors_of(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = path;
    while let Some(pos) = current.rfind('/') {
        current = &current[..pos];
        result.push(current.to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const LAMB: &[u8] = b"Mary had a little lamb,
Its fleece was white as snow;
And everywhere that Mary went
The lamb was sure to go.

It followed her to school one day,
Which was against the rule;
It made the children laugh and play
To see a lamb at school.";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        compress(&mut Cursor::new(data), &mut out).unwrap();
        out
    }

    #[test]
    fn compress_round_trips() {
        let compressed = gzip(LAMB);
        assert!(compressed.len() < LAMB.len());

        let mut decompressed = Vec::new();
        decompress(Cursor::new(&compressed), &mut decompressed).unwrap();
        assert_eq!(decompressed, LAMB);
    }

    #[test]
    fn is_gzip_detects_archives() {
        let compressed = gzip(LAMB);
        assert!(is_gzip(&mut Cursor::new(&compressed)).unwrap());
        assert!(!is_gzip(&mut Cursor::new(LAMB)).unwrap());
        assert!(!is_gzip(&mut Cursor::new(b"")).unwrap());
    }

    #[test]
    fn is_gzip_rewinds() {
        let compressed = gzip(LAMB);
        let mut cursor = Cursor::new(&compressed);
        is_gzip(&mut cursor).unwrap();
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn canonical_archive_is_recompressible() {
        let compressed = gzip(LAMB);

        let mut reader = RecompressingReader::new(Cursor::new(&compressed));
        let mut decompressed = Vec::new();
        reader.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, LAMB);
        assert!(reader.finish().unwrap());
    }

    #[test]
    fn foreign_archive_is_not_recompressible() {
        // Same deflate payload, different header: flip the OS byte.
        let mut compressed = gzip(LAMB);
        compressed[9] = compressed[9].wrapping_add(1);

        assert!(!recompressible(Cursor::new(&compressed)).unwrap());
    }

    #[test]
    fn different_level_is_not_recompressible() {
        let mut foreign = Vec::new();
        let mut encoder = GzEncoder::new(&mut foreign, Compression::fast());
        io::copy(&mut Cursor::new(LAMB), &mut encoder).unwrap();
        encoder.finish().unwrap();

        // Fast-level output carries a different XFL header byte at
        // minimum, so the round trip cannot be transparent.
        if foreign != gzip(LAMB) {
            assert!(!recompressible(Cursor::new(&foreign)).unwrap());
        }
    }

    #[test]
    fn decompress_walking_creates_siblings() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("layer.gz"), gzip(LAMB)).unwrap();
        fs::write(dir.path().join("plain.txt"), b"not an archive").unwrap();

        let view = decompress_walking(dir.path()).unwrap();

        assert!(view.present(&format!("layer.gz{SUFFIX}")));
        assert!(!view.present("layer.gz"));
        assert!(view.present("plain.txt"));
        assert_eq!(
            fs::read(dir.path().join(format!("layer.gz{SUFFIX}"))).unwrap(),
            LAMB
        );
    }

    #[test]
    fn decompress_walking_includes_ancestors() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("blobs/sha256")).unwrap();
        fs::write(dir.path().join("blobs/sha256/layer"), gzip(LAMB)).unwrap();

        let view = decompress_walking(dir.path()).unwrap();
        assert!(view.present("blobs"));
        assert!(view.present("blobs/sha256"));
        assert!(view.present(&format!("blobs/sha256/layer{SUFFIX}")));
    }

    #[test]
    fn decompress_walking_skips_cache_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(CACHE_DIR)).unwrap();
        fs::write(dir.path().join(CACHE_DIR).join("cached"), gzip(LAMB)).unwrap();

        let view = decompress_walking(dir.path()).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn decompress_walking_leaves_foreign_archives_alone() {
        let dir = TempDir::new().unwrap();
        let mut foreign = gzip(LAMB);
        foreign[9] = foreign[9].wrapping_add(1);
        fs::write(dir.path().join("untrusted.gz"), &foreign).unwrap();

        let view = decompress_walking(dir.path()).unwrap();

        assert!(view.present("untrusted.gz"));
        assert!(!dir.path().join(format!("untrusted.gz{SUFFIX}")).exists());
        assert_eq!(fs::read(dir.path().join("untrusted.gz")).unwrap(), foreign);
    }

    #[test]
    fn decompress_walking_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("layer.gz"), gzip(LAMB)).unwrap();

        let first = decompress_walking(dir.path()).unwrap();
        let second = decompress_walking(dir.path()).unwrap();
        assert_eq!(first.sorted(), second.sorted());
    }

    #[test]
    fn recompress_rebuilds_original_bytes() {
        let dir = TempDir::new().unwrap();
        let archive = gzip(LAMB);
        fs::write(dir.path().join("layer.gz"), &archive).unwrap();

        decompress_walking(dir.path()).unwrap();
        fs::remove_file(dir.path().join("layer.gz")).unwrap();

        recompress_all_in(dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("layer.gz")).unwrap(), archive);
    }

    #[test]
    fn recompress_skips_existing_companions() {
        let dir = TempDir::new().unwrap();
        let archive = gzip(LAMB);
        fs::write(dir.path().join("layer.gz"), &archive).unwrap();
        decompress_walking(dir.path()).unwrap();

        // Companion still present: nothing to do, archive untouched.
        recompress_all_in(dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("layer.gz")).unwrap(), archive);
    }

    #[test]
    fn clean_removes_siblings() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("layer.gz"), gzip(LAMB)).unwrap();
        decompress_walking(dir.path()).unwrap();
        assert!(dir.path().join(format!("layer.gz{SUFFIX}")).exists());

        clean(dir.path()).unwrap();
        assert!(!dir.path().join(format!("layer.gz{SUFFIX}")).exists());
        assert!(dir.path().join("layer.gz").exists());
    }
}
