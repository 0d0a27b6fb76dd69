//! Shared test utilities for tunerdb crates.
//!
//! - [`TestDir`] - Scratch directory for database files
//! - [`wait_until`] - Poll a condition until it's true or timeout
//! - [`strategies`] - Proptest strategies for field values and keys

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::wait_until;

pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    // ============================================
    // TestDir tests
    // ============================================

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().exists(), "temp directory should exist");
        assert!(dir.path().is_dir(), "should be a directory");
    }

    #[test]
    fn test_dir_paths_and_listing() {
        let dir = TestDir::new();
        let db = dir.db_path("epgdb");
        assert!(db.starts_with(dir.path()));
        assert!(db.ends_with("epgdb.redb"));
        std::fs::write(&db, b"x").expect("write file");
        std::fs::write(dir.join("epgdb.redb.bak"), b"x").expect("write file");
        assert_eq!(dir.file_names(), vec!["epgdb.redb", "epgdb.redb.bak"]);
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.redb"), "data").expect("write file");
            assert!(p.exists());
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    // ============================================
    // wait_until tests
    // ============================================

    #[test]
    fn test_wait_until_immediate_success() {
        assert!(wait_until(Duration::from_millis(100), || true));
    }

    #[test]
    fn test_wait_until_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = wait_until(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        });
        assert!(result, "condition should eventually become true");
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_wait_until_timeout() {
        assert!(!wait_until(Duration::from_millis(50), || false));
    }

    #[test]
    fn test_wait_until_sees_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::SeqCst);
            })
        };
        assert!(wait_until(Duration::from_secs(2), || flag.load(Ordering::SeqCst)));
        setter.join().unwrap();
    }
}
