//! Compressed tar artifacts with content checksums.
//!
//! Every adapter ships its output through here: entries are written into a
//! tar stream, compressed (gzip or zstd), and hashed with SHA-256 as the
//! compressed bytes hit the disk. The archive is written to a `.partial`
//! sibling and renamed into place once complete.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{OrchestratorError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip(u32),
    Zstd(i32),
}

impl Compression {
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name {
            "gzip" => Ok(Compression::Gzip(level.clamp(1, 9) as u32)),
            "zstd" => Ok(Compression::Zstd(level.clamp(1, 22))),
            other => Err(OrchestratorError::Configuration(format!(
                "unsupported compression '{}'",
                other
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip(_) => "tar.gz",
            Compression::Zstd(_) => "tar.zst",
        }
    }

    /// Artifact file name for a component, e.g. `database.tar.gz`.
    pub fn artifact_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.extension())
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip(6)
    }
}

/// A finished archive on disk.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Writer that hashes and counts everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Encoder<W: Write> {
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(inner: W, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::Gzip(level) => {
                Encoder::Gzip(flate2::write::GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            Compression::Zstd(level) => Encoder::Zstd(zstd::stream::write::Encoder::new(inner, level)?),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

/// An archive being assembled. Call [`ArchiveWriter::finish`] to publish it.
pub struct ArchiveWriter {
    dest: PathBuf,
    partial: PathBuf,
    builder: tar::Builder<Encoder<HashingWriter<BufWriter<File>>>>,
}

impl ArchiveWriter {
    pub fn create(dest: &Path, compression: Compression) -> Result<Self> {
        let partial = partial_path(dest);
        let file = File::create(&partial)?;
        let hashing = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
            written: 0,
        };
        let mut builder = tar::Builder::new(Encoder::new(hashing, compression)?);
        builder.follow_symlinks(false);
        Ok(Self {
            dest: dest.to_path_buf(),
            partial,
            builder,
        })
    }

    /// Add a single file under `name`.
    pub fn append_file(&mut self, src: &Path, name: &str) -> Result<()> {
        self.builder.append_path_with_name(src, name)?;
        Ok(())
    }

    /// Add an in-memory blob under `name`.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    /// Add every entry of `root` below `prefix` (empty prefix = archive root).
    pub fn append_directory(&mut self, root: &Path, prefix: &str, options: &WalkOptions) -> Result<usize> {
        let entries = walk_directory(root, options)?;
        for entry in &entries {
            let name = if prefix.is_empty() {
                entry.relative_path.clone()
            } else {
                Path::new(prefix).join(&entry.relative_path)
            };
            if entry.is_dir {
                self.builder.append_dir(&name, &entry.path)?;
            } else {
                self.builder.append_path_with_name(&entry.path, &name)?;
            }
        }
        Ok(entries.len())
    }

    /// Flush, fsync and atomically move the archive into place.
    pub fn finish(self) -> Result<PackedArchive> {
        let ArchiveWriter { dest, partial, builder } = self;
        let encoder = builder.into_inner()?;
        let mut hashing = encoder.finish()?;
        hashing.flush()?;
        let HashingWriter { inner, hasher, written } = hashing;
        let file = inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&partial, &dest)?;

        Ok(PackedArchive {
            path: dest,
            size_bytes: written,
            checksum: format!("sha256:{:x}", hasher.finalize()),
        })
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Archive a whole directory tree.
pub fn pack_directory(
    src: &Path,
    dest: &Path,
    compression: Compression,
    options: &WalkOptions,
) -> Result<PackedArchive> {
    let mut writer = ArchiveWriter::create(dest, compression)?;
    writer.append_directory(src, "", options)?;
    writer.finish()
}

/// Extract an archive into `dest_dir`, detecting the compression from its header.
///
/// Entries that would escape `dest_dir` are rejected by the tar reader.
pub fn unpack(archive: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 4];
    let read = read_prefix(&mut file, &mut magic)?;
    let file = File::open(archive)?;

    let reader: Box<dyn Read> = if read >= 2 && magic[..2] == GZIP_MAGIC {
        Box::new(flate2::read::GzDecoder::new(BufReader::new(file)))
    } else if read == 4 && magic == ZSTD_MAGIC {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        return Err(OrchestratorError::Integrity(format!(
            "{} is not a gzip or zstd archive",
            archive.display()
        )));
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.unpack(dest_dir).map_err(|e| {
        OrchestratorError::Integrity(format!("cannot extract {}: {}", archive.display(), e))
    })?;
    Ok(())
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// SHA-256 of a file's bytes, formatted `sha256:<hex>`.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, formatted `sha256:<hex>`.
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}
