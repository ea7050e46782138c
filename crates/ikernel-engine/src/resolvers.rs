//! Dependency resolvers.

use std::path::PathBuf;

use crate::error::EvaluationError;

/// Resolves an artifact reference to local paths.
pub trait DependencyResolver: Send + Sync {
    /// # Errors
    /// Returns [`EvaluationError::Dependency`] when the reference is
    /// invalid or cannot be resolved.
    fn resolve(&self, uri: &str) -> Result<Vec<PathBuf>, EvaluationError>;
}

/// Resolves `file://` references to existing local artifacts.
pub struct FileResolver;

impl DependencyResolver for FileResolver {
    fn resolve(&self, uri: &str) -> Result<Vec<PathBuf>, EvaluationError> {
        let path = uri.strip_prefix("file://").ok_or_else(|| {
            EvaluationError::Dependency(
                "Invalid file reference. The URL must be of the form file://<full path>.".into(),
            )
        })?;

        let path = PathBuf::from(path);
        if !path.exists() || path.is_dir() {
            return Err(EvaluationError::Dependency(
                "Invalid file reference. The URL must refer to an artifact file.".into(),
            ));
        }
        Ok(vec![path])
    }
}
