//! Scratch directories for on-disk databases.

#![allow(clippy::expect_used)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// A temporary directory holding test database files, removed on drop.
///
/// ```
/// use tunerdb_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let chdb = dir.db_path("chdb");
/// assert!(chdb.ends_with("chdb.redb"));
/// assert!(dir.file_names().is_empty());
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates the directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: tempfile::Builder::new().prefix("tunerdb-").tempdir().expect("create temp dir") }
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Path of `name` inside the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.inner.path().join(name)
    }

    /// Path of the database file `<name>.redb`.
    #[must_use]
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.join(format!("{name}.redb"))
    }

    /// Sorted names of the files currently in the directory.
    ///
    /// Upgrade tests use this to check that no temporary output was left behind.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be read.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.path())
            .expect("read temp dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
