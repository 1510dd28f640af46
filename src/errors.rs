use std::path::PathBuf;
use thiserror::Error;

/// Structured error type for every stage of the frame pipeline.
///
/// Each variant carries the context of its stage (filesystem, imaging, model,
/// external tool, video decoding) so callers can report a precise message
/// without parsing strings.
#[derive(Error, Debug)]
pub enum SpriteCullError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("External tool error: {tool} {operation}: {reason}")]
    ExternalTool {
        tool: String,
        operation: String,
        reason: String,
    },

    #[error("Video error: {reason} ({path:?})")]
    Video { path: PathBuf, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SpriteCullError>;

impl SpriteCullError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn fs(path: impl Into<PathBuf>, operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    pub fn model(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Model {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

/// Fallback for I/O errors raised without path context.
///
/// Code that knows the path and operation should build
/// `SpriteCullError::FileSystem` directly.
impl From<std::io::Error> for SpriteCullError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SpriteCullError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for SpriteCullError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor reshaping around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for SpriteCullError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for SpriteCullError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration {
            message: format!("JSON error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message() {
        let err = SpriteCullError::validation("threshold", "must be within 0..=1");
        assert_eq!(
            err.to_string(),
            "Validation error: threshold must be within 0..=1"
        );
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SpriteCullError = io.into();
        match err {
            SpriteCullError::FileSystem { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
