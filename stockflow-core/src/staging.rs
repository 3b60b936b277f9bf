//! The staging directory shared by the fetch, load and archive steps.
//!
//! Layout: `{dir}/{STEM}.csv` per ticker, `{dir}/archive/{timestamp}.zip` per run.

use crate::domain::Ticker;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ARCHIVE_SUBDIR: &str = "archive";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging directory {} does not exist (set staging.create_missing = true to create it)", .0.display())]
    Missing(PathBuf),

    #[error("staging path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to create staging directory {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A staging directory that was checked (or created) at the start of a run.
#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    /// Check the directory exists, creating it first when `create_missing` is set.
    pub fn prepare(root: impl Into<PathBuf>, create_missing: bool) -> Result<Self, StagingError> {
        let root = root.into();

        if !root.exists() {
            if !create_missing {
                return Err(StagingError::Missing(root));
            }
            fs::create_dir_all(&root).map_err(|source| StagingError::Create {
                path: root.clone(),
                source,
            })?;
        }

        if !root.is_dir() {
            return Err(StagingError::NotADirectory(root));
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a ticker's CSV artifact: `{dir}/{STEM}.csv`.
    pub fn csv_path(&self, ticker: &Ticker) -> PathBuf {
        self.root.join(ticker.csv_file_name())
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_SUBDIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_fails_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("download");
        let err = StagingDir::prepare(&dir, false).unwrap_err();
        assert!(matches!(err, StagingError::Missing(p) if p == dir));
        assert!(!dir.exists());
    }

    #[test]
    fn missing_directory_is_created_on_request() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/download");
        let staging = StagingDir::prepare(&dir, true).unwrap();
        assert!(dir.is_dir());
        assert_eq!(staging.root(), dir.as_path());
    }

    #[test]
    fn file_in_place_of_directory_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("download");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            StagingDir::prepare(&file, true),
            Err(StagingError::NotADirectory(_))
        ));
    }

    #[test]
    fn artifact_paths_use_sanitized_ticker() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingDir::prepare(tmp.path(), false).unwrap();
        let path = staging.csv_path(&Ticker::new("^GSPC").unwrap());
        assert_eq!(path, tmp.path().join("GSPC.csv"));
        assert_eq!(staging.archive_dir(), tmp.path().join("archive"));
    }
}
