//! Plain-text vertex export guarded by a sibling lock file.
//!
//! While a mesh is being written, an empty file named `<path>lock` exists
//! next to the output. Readers polling the output must treat its presence
//! as "not ready yet". The lock is advisory: a crash mid-write leaves it
//! behind.

use crate::vertices::sort_and_dedup;
use glam::Vec3;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while exporting a mesh.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to create lock file {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write mesh {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result of a completed export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Output file that was written.
    pub path: PathBuf,
    /// Vertices that came out of the engine.
    pub input_vertices: usize,
    /// Distinct vertices written to the file.
    pub written_vertices: usize,
}

/// A sorted, deduplicated mesh snapshot ready to be written.
#[derive(Debug, Clone, Default)]
pub struct ExportJob {
    vertices: Vec<Vec3>,
    input_vertices: usize,
}

impl ExportJob {
    /// Build a job from a raw engine vertex list.
    pub fn from_vertices(vertices: Vec<Vec3>) -> Self {
        let input_vertices = vertices.len();
        let vertices = sort_and_dedup(vertices);
        debug!(
            "Export job: {} vertices, {} distinct",
            input_vertices,
            vertices.len()
        );
        Self {
            vertices,
            input_vertices,
        }
    }

    /// Distinct vertices in ascending (x, y, z) order.
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    /// Number of distinct vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether the snapshot has no vertices.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Write `x -y -z` per line to `path`.
    ///
    /// The lock file is created before the output is opened and removed on
    /// every exit path, including write failures.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn write_to(&self, path: &Path) -> Result<ExportSummary, ExportError> {
        let lock = LockFile::create(lock_path_for(path))?;

        let result = self.write_vertices(path);
        drop(lock);

        result.map_err(|source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            "Exported {} vertices to {}",
            self.vertices.len(),
            path.display()
        );
        Ok(ExportSummary {
            path: path.to_path_buf(),
            input_vertices: self.input_vertices,
            written_vertices: self.vertices.len(),
        })
    }

    fn write_vertices(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for v in &self.vertices {
            writeln!(writer, "{:.6} {:.6} {:.6}", v.x, -v.y, -v.z)?;
        }
        writer.flush()
    }
}

/// Path of the lock file that marks `path` as being written.
///
/// The suffix is appended to the full file name, so `mesh.txt` becomes
/// `mesh.txtlock`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push("lock");
    PathBuf::from(name)
}

/// Whether a writer currently holds the lock for `path`.
pub fn is_export_in_progress(path: &Path) -> bool {
    lock_path_for(path).exists()
}

/// Removes the lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn create(path: PathBuf) -> Result<Self, ExportError> {
        match File::create(&path) {
            Ok(_) => Ok(Self { path }),
            Err(source) => Err(ExportError::Lock { path, source }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/out/mesh.txt")),
            PathBuf::from("/tmp/out/mesh.txtlock")
        );
    }

    #[test]
    fn test_write_sorted_dedup_flipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.txt");

        let job = ExportJob::from_vertices(vec![
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.5, -1.0, 0.25),
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.5, -1.0, 0.25),
            Vec3::new(-2.0, 0.0, 1.0),
        ]);
        let summary = job.write_to(&path).unwrap();

        assert_eq!(summary.input_vertices, 5);
        assert_eq!(summary.written_vertices, 3);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "-2.000000 -0.000000 -1.000000",
                "0.500000 1.000000 -0.250000",
                "1.000000 -2.000000 -3.000000",
            ]
        );
        assert!(contents.ends_with('\n'));
        assert!(!is_export_in_progress(&path));
    }

    #[test]
    fn test_empty_mesh_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");

        let summary = ExportJob::from_vertices(Vec::new()).write_to(&path).unwrap();
        assert_eq!(summary.written_vertices, 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_lock_removed_when_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the output path makes the write fail after the lock exists.
        let path = dir.path().join("mesh.txt");
        fs::create_dir(&path).unwrap();

        let err = ExportJob::from_vertices(vec![Vec3::ONE])
            .write_to(&path)
            .unwrap_err();
        assert!(matches!(err, ExportError::Write { .. }));
        assert!(!lock_path_for(&path).exists());
    }

    #[test]
    fn test_missing_directory_fails_on_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("mesh.txt");

        let err = ExportJob::from_vertices(vec![Vec3::ONE])
            .write_to(&path)
            .unwrap_err();
        assert!(matches!(err, ExportError::Lock { .. }));
    }

    #[test]
    fn test_in_progress_while_lock_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.txt");
        File::create(lock_path_for(&path)).unwrap();
        assert!(is_export_in_progress(&path));
    }
}
