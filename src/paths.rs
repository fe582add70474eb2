//! Path utilities for statharvest data storage.

use std::path::{Path, PathBuf};

/// Default task store filename.
pub const STORE_DB_FILENAME: &str = "problems.db";

/// Get the data directory for statharvest.
///
/// Uses the platform data directory:
/// - Linux: `~/.local/share/statharvest`
/// - macOS: `~/Library/Application Support/statharvest`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("statharvest"))
        .unwrap_or_else(|| PathBuf::from(".statharvest"))
}

/// Get the default path of the SQLite task store.
pub fn get_store_path() -> PathBuf {
    get_data_dir().join(STORE_DB_FILENAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// This handles the common case where shell tilde expansion doesn't occur,
/// such as when using `--db-path=~/problems.db` instead of `--db-path ~/problems.db`.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use statharvest::paths::expand_tilde;
///
/// let path = PathBuf::from("~/benchmarks");
/// let expanded = expand_tilde(&path);
/// assert!(!expanded.to_str().unwrap().starts_with("~"));
///
/// let path = PathBuf::from("/tmp/foo");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

/// Resolve a model or instance reference stored with a problem.
///
/// Absolute references (after tilde expansion) are used as-is; anything
/// else is relative to `data_dir`.
pub fn resolve_input(data_dir: &Path, reference: &str) -> PathBuf {
    let path = expand_tilde(reference);
    if path.is_absolute() {
        path
    } else {
        data_dir.join(path)
    }
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
