//! Batch model: what gets sent, what came back.

use crate::core::config::MAX_FILE_SIZE;
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::warn;

// ── Outgoing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// One file of an outgoing batch.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub name: String,
    pub size: u64,
    pub source: FileSource,
}

impl FileRef {
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            size: meta.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    pub(crate) async fn open(&self) -> std::io::Result<SourceReader> {
        Ok(match &self.source {
            FileSource::Path(p) => SourceReader::File(tokio::fs::File::open(p).await?),
            FileSource::Memory(b) => SourceReader::Memory(b.clone()),
        })
    }
}

pub(crate) enum SourceReader {
    File(tokio::fs::File),
    Memory(Bytes),
}

impl SourceReader {
    /// Read `[offset, offset + len)`, clamped to `size`.
    pub(crate) async fn read_chunk(
        &mut self,
        offset: u64,
        len: usize,
        size: u64,
    ) -> std::io::Result<Bytes> {
        let len = (len as u64).min(size.saturating_sub(offset)) as usize;
        match self {
            SourceReader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            SourceReader::Memory(data) => {
                let start = offset as usize;
                let end = start + len;
                if end > data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "source shorter than declared size",
                    ));
                }
                Ok(data.slice(start..end))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    TooLarge,
}

/// Files accepted for sending, and the ones left out.
#[derive(Debug, Default)]
pub struct FileSelection {
    pub accepted: Vec<FileRef>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl FileSelection {
    /// Drops empty files and files above the 2 GiB limit.
    pub fn new(files: impl IntoIterator<Item = FileRef>) -> Self {
        Self::with_limit(files, MAX_FILE_SIZE)
    }

    pub fn with_limit(files: impl IntoIterator<Item = FileRef>, max_size: u64) -> Self {
        let mut sel = Self::default();
        for f in files {
            if f.size == 0 {
                warn!(file = %f.name, "skipping empty file");
                sel.skipped.push((f.name, SkipReason::Empty));
            } else if f.size > max_size {
                warn!(file = %f.name, size = f.size, "skipping file above size limit");
                sel.skipped.push((f.name, SkipReason::TooLarge));
            } else {
                sel.accepted.push(f);
            }
        }
        sel
    }

    pub fn total_bytes(&self) -> u64 {
        self.accepted.iter().map(|f| f.size).sum()
    }
}

// ── Incoming ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub(crate) fn assemble(name: String, chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for c in chunks {
            buf.extend_from_slice(&c);
        }
        Self {
            name,
            data: buf.freeze(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Files handed to the host at the end (or cancellation) of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedBatch {
    pub files: Vec<ReceivedFile>,
    pub cancelled: bool,
}

impl CompletedBatch {
    /// More than one file: the host may offer a combined download.
    pub fn is_combined(&self) -> bool {
        self.files.len() > 1
    }

    /// ZIP archive of every file (stored, no compression), or `None` for a
    /// single file. Duplicate names get a ` (n)` suffix.
    pub fn combined_archive(&self) -> zip::result::ZipResult<Option<Vec<u8>>> {
        if !self.is_combined() {
            return Ok(None);
        }
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(self.files.iter().any(|f| f.size() > u32::MAX as u64));

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let mut used = HashSet::new();
        for f in &self.files {
            zip.start_file(unique_name(&f.name, &mut used), options)?;
            zip.write_all(&f.data)?;
        }
        Ok(Some(zip.finish()?.into_inner()))
    }
}

fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn selection_skips_empty_and_oversized() {
        let sel = FileSelection::with_limit(
            vec![
                FileRef::from_bytes("a", vec![1u8; 10]),
                FileRef::from_bytes("empty", Vec::new()),
                FileRef::from_bytes("big", vec![0u8; 101]),
            ],
            100,
        );
        assert_eq!(sel.accepted.len(), 1);
        assert_eq!(sel.total_bytes(), 10);
        assert_eq!(
            sel.skipped,
            vec![
                ("empty".to_string(), SkipReason::Empty),
                ("big".to_string(), SkipReason::TooLarge)
            ]
        );
    }

    #[tokio::test]
    async fn memory_reader_clamps_last_chunk() {
        let f = FileRef::from_bytes("x", vec![7u8; 40]);
        let mut r = f.open().await.unwrap();
        assert_eq!(r.read_chunk(0, 16, 40).await.unwrap().len(), 16);
        assert_eq!(r.read_chunk(32, 16, 40).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn file_reader_reads_from_disk() {
        let dir = std::env::temp_dir().join("rtcportal_test").join("batch_reader");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("data.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();

        let f = FileRef::from_path(&path).await.unwrap();
        assert_eq!(f.name, "data.bin");
        assert_eq!(f.size, 100);
        let mut r = f.open().await.unwrap();
        assert_eq!(&r.read_chunk(90, 16, 100).await.unwrap()[..], &(90u8..100).collect::<Vec<_>>()[..]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn single_file_has_no_archive() {
        let batch = CompletedBatch {
            files: vec![ReceivedFile::assemble("a".into(), vec![Bytes::from_static(b"x")])],
            cancelled: false,
        };
        assert!(batch.combined_archive().unwrap().is_none());
    }

    #[test]
    fn archive_contains_every_file() {
        let batch = CompletedBatch {
            files: vec![
                ReceivedFile::assemble("a.txt".into(), vec![Bytes::from_static(b"hello")]),
                ReceivedFile::assemble("a.txt".into(), vec![Bytes::from_static(b"world")]),
            ],
            cancelled: false,
        };
        let bytes = batch.combined_archive().unwrap().unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut second = String::new();
        archive
            .by_name("a (1).txt")
            .unwrap()
            .read_to_string(&mut second)
            .unwrap();
        assert_eq!(second, "world");
    }
}
