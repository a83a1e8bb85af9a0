use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::classify::{classify_package, PartPartition};
use crate::options::PackageLimits;
use crate::XlsxError;

/// Byte source behind an open archive.
#[derive(Debug)]
pub(crate) enum Source {
    File(File),
    Bytes(Cursor<Vec<u8>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::File(f) => f.read(buf),
            Source::Bytes(c) => c.read(buf),
        }
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Source::File(f) => f.seek(pos),
            Source::Bytes(c) => c.seek(pos),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub name: String,
    pub is_dir: bool,
}

/// An open package: the archive handle plus its entry list, in container order.
///
/// Part contents are only inflated on request.
#[derive(Debug)]
pub struct Package {
    path: Option<PathBuf>,
    archive: ZipArchive<Source>,
    entries: Vec<Entry>,
    partition: PartPartition,
    limits: PackageLimits,
}

impl Package {
    pub fn open(path: impl AsRef<Path>, limits: PackageLimits) -> Result<Self, XlsxError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| XlsxError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut package = Self::from_source(Source::File(file), limits)?;
        package.path = Some(path.to_path_buf());
        Ok(package)
    }

    pub fn from_bytes(bytes: Vec<u8>, limits: PackageLimits) -> Result<Self, XlsxError> {
        Self::from_source(Source::Bytes(Cursor::new(bytes)), limits)
    }

    fn from_source(source: Source, limits: PackageLimits) -> Result<Self, XlsxError> {
        let mut archive = ZipArchive::new(source)?;
        if archive.len() > limits.max_parts {
            return Err(XlsxError::TooManyParts {
                count: archive.len(),
                max: limits.max_parts,
            });
        }

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            entries.push(Entry {
                name: file.name().to_string(),
                is_dir: file.is_dir(),
            });
        }

        let partition = classify_package(
            entries
                .iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.name.as_str()),
        );
        log::debug!(
            "opened package: {} parts ({} managed, {} opaque)",
            partition.managed.len() + partition.opaque.len(),
            partition.managed.len(),
            partition.opaque.len()
        );

        Ok(Self {
            path: None,
            archive,
            entries,
            partition,
            limits,
        })
    }

    /// Path the package was opened from, if it came from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn limits(&self) -> PackageLimits {
        self.limits
    }

    /// Part names (files only) in container order.
    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name.as_str())
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn partition(&self) -> &PartPartition {
        &self.partition
    }

    pub(crate) fn promote_to_managed(&mut self, name: &str) {
        self.partition.promote(name);
    }

    /// Exact entry name for `name`, tolerating a leading `/` and ASCII case differences.
    pub fn find_part(&self, name: &str) -> Option<&str> {
        let wanted = name.trim_start_matches('/');
        self.part_names()
            .find(|n| *n == wanted)
            .or_else(|| {
                self.part_names()
                    .find(|n| n.trim_start_matches('/').eq_ignore_ascii_case(wanted))
            })
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.find_part(name).is_some()
    }

    /// Inflate one part. Returns `Ok(None)` when the part does not exist.
    pub fn read_part(&mut self, name: &str) -> Result<Option<Vec<u8>>, XlsxError> {
        let Some(actual) = self.find_part(name).map(str::to_string) else {
            return Ok(None);
        };
        let max = self.limits.max_part_bytes;
        let file = self.archive.by_name(&actual)?;

        if file.size() > max {
            return Err(XlsxError::PartTooLarge {
                part: actual,
                size: file.size(),
                max,
            });
        }

        // Don't trust the declared size alone: read at most `max + 1` bytes.
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.take(max.saturating_add(1)).read_to_end(&mut buf)?;
        if buf.len() as u64 > max {
            return Err(XlsxError::PartTooLarge {
                part: actual,
                size: buf.len() as u64,
                max,
            });
        }
        Ok(Some(buf))
    }

    pub fn read_required_part(&mut self, name: &str) -> Result<Vec<u8>, XlsxError> {
        self.read_part(name)?
            .ok_or_else(|| XlsxError::MissingPart(name.to_string()))
    }

    pub(crate) fn archive_mut(&mut self) -> &mut ZipArchive<Source> {
        &mut self.archive
    }
}
