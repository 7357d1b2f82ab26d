//! Shared helpers for unit tests.

use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A fresh `tollgate-<label>-*` directory, removed when dropped
pub fn temp_dir(label: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("tollgate-{}-", label))
        .tempdir()
        .expect("create temp dir")
}

/// Held by every test that spawns a freshly written script.
///
/// Writing an executable while another thread forks can leave the write
/// descriptor open in the child and fail the exec with ETXTBSY.
pub static SPAWN_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub fn spawn_guard() -> std::sync::MutexGuard<'static, ()> {
    SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Write an executable `/bin/sh` script named `engine.sh` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("engine.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}
