//! Archive step: bundle staged CSV artifacts into a timestamped zip.

use crate::staging::StagingDir;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const BUNDLE_NAME_FORMAT: &str = "%Y-%m-%dT%H%M";

/// Which directory the archiver scans for CSV files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveScope {
    /// The staging directory itself, minus its `archive/` subdirectory.
    #[default]
    Staging,
    /// Only the `archive/` subdirectory.
    ArchiveDir,
}

impl ArchiveScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveScope::Staging => "staging",
            ArchiveScope::ArchiveDir => "archive_dir",
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive bundle {} already exists", .0.display())]
    ArchiveExists(PathBuf),

    #[error("archive I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write zip {}: {source}", path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub path: PathBuf,
    /// Entry names inside the bundle, `/`-separated, in the order written.
    pub files: Vec<String>,
}

pub struct Archiver<'a> {
    staging: &'a StagingDir,
    scope: ArchiveScope,
}

impl<'a> Archiver<'a> {
    pub fn new(staging: &'a StagingDir, scope: ArchiveScope) -> Self {
        Self { staging, scope }
    }

    pub fn archive(&self) -> Result<ArchiveReport, ArchiveError> {
        self.archive_at(Utc::now())
    }

    /// Write `<staging>/archive/<now:%Y-%m-%dT%H%M>.zip`. Source files are left in place.
    pub fn archive_at(&self, now: DateTime<Utc>) -> Result<ArchiveReport, ArchiveError> {
        let archive_dir = self.staging.archive_dir();
        fs::create_dir_all(&archive_dir).map_err(|source| ArchiveError::Io {
            path: archive_dir.clone(),
            source,
        })?;

        let (scan_root, exclude) = match self.scope {
            ArchiveScope::Staging => (self.staging.root().to_path_buf(), Some(archive_dir.clone())),
            ArchiveScope::ArchiveDir => (archive_dir.clone(), None),
        };

        let mut entries = Vec::new();
        collect_csv(&scan_root, &scan_root, exclude.as_deref(), &mut entries)?;

        let path = archive_dir.join(format!("{}.zip", now.format(BUNDLE_NAME_FORMAT)));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ArchiveError::ArchiveExists(path))
            }
            Err(source) => return Err(ArchiveError::Io { path, source }),
        };

        if let Err(e) = write_bundle(file, &path, &entries) {
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "failed to remove partial bundle");
            }
            return Err(e);
        }

        let files: Vec<String> = entries.into_iter().map(|(name, _)| name).collect();
        info!(
            path = %path.display(),
            files = files.len(),
            scope = self.scope.as_str(),
            "archive written"
        );
        Ok(ArchiveReport { path, files })
    }
}

fn write_bundle(file: File, path: &Path, entries: &[(String, PathBuf)]) -> Result<(), ArchiveError> {
    let zip_err = |source| ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    };
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut zip = ZipWriter::new(file);
    for (name, source_path) in entries {
        debug!(entry = %name, "adding to archive");
        zip.start_file(name.as_str(), options).map_err(zip_err)?;
        let mut src = File::open(source_path).map_err(|source| ArchiveError::Io {
            path: source_path.clone(),
            source,
        })?;
        io::copy(&mut src, &mut zip).map_err(|source| ArchiveError::Io {
            path: source_path.clone(),
            source,
        })?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}

/// Recursively gather `*.csv` files under `dir`, sorted, skipping `exclude`.
fn collect_csv(
    root: &Path,
    dir: &Path,
    exclude: Option<&Path>,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();

    for path in paths {
        if path.is_dir() {
            if exclude != Some(path.as_path()) {
                collect_csv(root, &path, exclude, out)?;
            }
        } else if path.extension().is_some_and(|ext| ext == "csv") {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}
