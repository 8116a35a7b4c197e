//! Store descriptor builder.
//!
//! # Responsibility
//! - Resolve `<base_dir>/<name>.sqlite` for a named store, creating the
//!   base directory when absent.
//! - Apply blank mode (wipe a prior file) under an explicit missing-file
//!   policy instead of a silent catch-and-discard.
//!
//! # Invariants
//! - Construction fails (returns `None`, logged) only when the base
//!   directory cannot be resolved or the store name is unusable.

use log::{info, warn};
use std::path::{Path, PathBuf};

/// File extension of the backing SQLite file.
pub const STORE_FILE_EXT: &str = "sqlite";

/// Protection applied to the backing file.
///
/// Generic analog of a platform file-protection class: `OwnerOnly`
/// restricts the file to the owning user (mode 0600 on unix);
/// `Unrestricted` leaves platform defaults in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileProtection {
    #[default]
    Unrestricted,
    OwnerOnly,
}

/// Named policy for blank-mode deletion of a prior store file.
///
/// `Ignore` is the lenient default: an absent file (or a failed delete) is
/// logged and skipped. `Fail` makes a delete failure abort descriptor
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingFilePolicy {
    #[default]
    Ignore,
    Fail,
}

/// Options consumed by [`StoreDescriptor::sqlite_store`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Wipe any prior file at the resolved path before configuring.
    pub blank: bool,
    pub missing_file: MissingFilePolicy,
    pub protection: FileProtection,
    /// Reconcile on-disk schema additions automatically at attach time.
    pub auto_migrate: bool,
    /// Attach the store off the caller's thread during `load`.
    pub attach_async: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            blank: false,
            missing_file: MissingFilePolicy::Ignore,
            protection: FileProtection::Unrestricted,
            auto_migrate: false,
            attach_async: true,
        }
    }
}

/// Configuration for one physical backing file. Immutable once built.
#[derive(Debug, Clone)]
pub struct StoreDescriptor {
    path: PathBuf,
    protection: FileProtection,
    auto_migrate: bool,
    attach_async: bool,
}

impl StoreDescriptor {
    /// Resolves a descriptor for the store named `name` under `base_dir`.
    ///
    /// Returns `None` (logged) when `name` is empty or contains path
    /// separators, when `base_dir` cannot be created, or when a strict
    /// blank-mode wipe fails.
    pub fn sqlite_store(name: &str, base_dir: &Path, options: StoreOptions) -> Option<Self> {
        if name.is_empty() || name.contains(['/', '\\']) {
            warn!("event=store_descriptor module=store status=error detail=bad_name name={name}");
            return None;
        }
        if let Err(err) = std::fs::create_dir_all(base_dir) {
            warn!(
                "event=store_descriptor module=store status=error detail=base_dir path={} error={err}",
                base_dir.display()
            );
            return None;
        }

        let path = base_dir.join(format!("{name}.{STORE_FILE_EXT}"));
        if options.blank && wipe_existing(&path, options.missing_file).is_err() {
            return None;
        }

        Some(Self {
            path,
            protection: options.protection,
            auto_migrate: options.auto_migrate,
            attach_async: options.attach_async,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn protection(&self) -> FileProtection {
        self.protection
    }

    pub fn auto_migrate(&self) -> bool {
        self.auto_migrate
    }

    pub fn attach_async(&self) -> bool {
        self.attach_async
    }
}

/// Removes a stale store file under the given policy. Under
/// `MissingFilePolicy::Ignore` every failure is logged and swallowed by
/// design; under `Fail` it is returned.
fn wipe_existing(path: &Path, policy: MissingFilePolicy) -> Result<(), ()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(
                "event=store_blank module=store status=ok path={}",
                path.display()
            );
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(
                "event=store_blank module=store status=skipped reason=missing path={}",
                path.display()
            );
            match policy {
                MissingFilePolicy::Ignore => Ok(()),
                MissingFilePolicy::Fail => Err(()),
            }
        }
        Err(err) => {
            warn!(
                "event=store_blank module=store status=error path={} error={err}",
                path.display()
            );
            match policy {
                MissingFilePolicy::Ignore => Ok(()),
                MissingFilePolicy::Fail => Err(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_the_expected_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor =
            StoreDescriptor::sqlite_store("Library", dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(descriptor.path(), dir.path().join("Library.sqlite"));
        assert!(descriptor.attach_async());
        assert!(!descriptor.auto_migrate());
    }

    #[test]
    fn rejects_unusable_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StoreDescriptor::sqlite_store("", dir.path(), StoreOptions::default()).is_none());
        assert!(
            StoreDescriptor::sqlite_store("a/b", dir.path(), StoreOptions::default()).is_none()
        );
    }

    #[test]
    fn blank_mode_removes_a_prior_file_and_ignores_a_missing_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Library.sqlite");
        std::fs::write(&path, b"stale").unwrap();

        let options = StoreOptions {
            blank: true,
            ..StoreOptions::default()
        };
        StoreDescriptor::sqlite_store("Library", dir.path(), options).unwrap();
        assert!(!path.exists());

        // Second wipe hits the missing-file path and still succeeds.
        StoreDescriptor::sqlite_store("Library", dir.path(), options).unwrap();
    }

    #[test]
    fn strict_missing_file_policy_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            blank: true,
            missing_file: MissingFilePolicy::Fail,
            ..StoreOptions::default()
        };
        assert!(StoreDescriptor::sqlite_store("Library", dir.path(), options).is_none());
    }

    #[test]
    fn creates_the_base_directory_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sandbox").join("stores");
        let descriptor =
            StoreDescriptor::sqlite_store("Library", &nested, StoreOptions::default()).unwrap();
        assert!(nested.is_dir());
        assert!(descriptor.path().starts_with(&nested));
    }
}
