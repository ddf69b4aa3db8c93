//! Path validation for user-provided directories.
//!
//! Project directories and worktree paths come from the UI and must never
//! escape the user's home directory or land in sensitive subtrees. Symlinks
//! are resolved before any comparison so a link cannot smuggle a path past
//! the checks.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Directory names that are off limits anywhere under the home directory.
const DENYLIST: &[&str] = &[
    ".ssh", ".gnupg", ".aws", ".config", ".kube", ".docker", ".azure", ".gcloud", ".password-store",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path does not exist: {0}")]
    NotFound(String),
    #[error("path is outside the home directory: {0}")]
    OutsideHome(String),
    #[error("path is inside a protected directory ({denied}): {path}")]
    Denied { path: String, denied: String },
    #[error("home directory could not be determined")]
    NoHome,
}

pub type Result<T> = std::result::Result<T, PathError>;

/// Validate a user-provided path against the default home directory.
pub fn validate_user_path(path: &Path) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(PathError::NoHome)?;
    validate_within(path, &home)
}

/// Validate that `path` resolves inside `root` and avoids the denylist.
///
/// `root` is a parameter so tests can use a scratch directory as the home.
/// The path must exist; canonicalization resolves symlinks in both the
/// candidate and the root before comparison.
pub fn validate_within(path: &Path, root: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|_| PathError::NotFound(path.display().to_string()))?;
    let root = root
        .canonicalize()
        .map_err(|_| PathError::NotFound(root.display().to_string()))?;

    if !canonical.starts_with(&root) {
        return Err(PathError::OutsideHome(canonical.display().to_string()));
    }

    let relative = canonical.strip_prefix(&root).unwrap_or(&canonical);
    for component in relative.components() {
        if let Component::Normal(name) = component {
            if let Some(name) = name.to_str() {
                if DENYLIST.contains(&name) {
                    return Err(PathError::Denied {
                        path: canonical.display().to_string(),
                        denied: name.to_string(),
                    });
                }
            }
        }
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_plain_subdirectory() {
        let home = TempDir::new().unwrap();
        let project = home.path().join("projects/demo");
        std::fs::create_dir_all(&project).unwrap();

        let validated = validate_within(&project, home.path()).unwrap();
        assert!(validated.ends_with("projects/demo"));
    }

    #[test]
    fn rejects_path_outside_root() {
        let home = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();

        let err = validate_within(elsewhere.path(), home.path()).unwrap_err();
        assert!(matches!(err, PathError::OutsideHome(_)));
    }

    #[test]
    fn rejects_denylisted_directories() {
        let home = TempDir::new().unwrap();
        for denied in [".ssh", ".aws", ".config"] {
            let dir = home.path().join(denied).join("sub");
            std::fs::create_dir_all(&dir).unwrap();
            let err = validate_within(&dir, home.path()).unwrap_err();
            assert!(
                matches!(err, PathError::Denied { .. }),
                "{denied} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_path() {
        let home = TempDir::new().unwrap();
        let err = validate_within(&home.path().join("nope"), home.path()).unwrap_err();
        assert!(matches!(err, PathError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn resolves_symlink_before_comparison() {
        let home = TempDir::new().unwrap();
        let secret = home.path().join(".ssh");
        std::fs::create_dir_all(&secret).unwrap();
        let link = home.path().join("innocent");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let err = validate_within(&link, home.path()).unwrap_err();
        assert!(matches!(err, PathError::Denied { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn resolves_symlink_escaping_root() {
        let home = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = home.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = validate_within(&link, home.path()).unwrap_err();
        assert!(matches!(err, PathError::OutsideHome(_)));
    }
}
