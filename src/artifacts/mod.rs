use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid output directory {path:?}: {reason}")]
    InvalidDir { path: PathBuf, reason: String },

    #[error("invalid artifact name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("artifact path escapes the output directory: {0}")]
    Escape(PathBuf),

    #[error("refusing to write through symlink: {0}")]
    Symlink(PathBuf),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Validates `dir`, creates it, and pins it to its canonical path.
    pub fn create(dir: &Path) -> Result<Self, ArtifactError> {
        let invalid = |reason: &str| ArtifactError::InvalidDir {
            path: dir.to_path_buf(),
            reason: reason.to_string(),
        };
        let s = dir.to_string_lossy();
        if s.trim().is_empty() {
            return Err(invalid("path is empty"));
        }
        if s.contains('\0') {
            return Err(invalid("path contains a NUL byte"));
        }
        if dir.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(invalid("path contains '..'"));
        }

        std::fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let root = dir.canonicalize().map_err(|source| ArtifactError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = |reason: &str| ArtifactError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if name == "." || name == ".." || name.contains("..") {
            return Err(invalid("name contains a traversal sequence"));
        }
        if name.contains(['/', '\\']) {
            return Err(invalid("name contains a path separator"));
        }
        if name.contains('\0') {
            return Err(invalid("name contains a NUL byte"));
        }
        if Path::new(name).is_absolute() {
            return Err(invalid("name is absolute"));
        }

        let path = self.root.join(name);
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| ArtifactError::Escape(path.clone()))?;
        match relative.components().next() {
            Some(Component::Normal(_)) => Ok(path),
            _ => Err(ArtifactError::Escape(path)),
        }
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.resolve(name)?;
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_symlink() {
                return Err(ArtifactError::Symlink(path));
            }
        }
        std::fs::write(&path, bytes).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
