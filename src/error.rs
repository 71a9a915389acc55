//! Error taxonomy for the vision pipeline.
//!
//! Application seams return `anyhow::Result`; the categories below are raised
//! where the caller needs to tell them apart (the API maps them to status codes,
//! the pipeline applies its detection-error policy). Recover them with
//! `err.downcast_ref::<VisionError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// Frame acquisition failed. Fatal for local files and devices, retried
    /// for network-style sources.
    #[error("source error: {0}")]
    Source(String),

    /// The detector failed on a single frame.
    #[error("detection error on frame {frame_id}: {message}")]
    Detection { frame_id: u64, message: String },

    /// Invalid zone or camera definition. Surfaced at startup or on add.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A traffic record could not be persisted. Logged, never propagated
    /// into the pipeline.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("camera {0} not found")]
    UnknownCamera(String),

    #[error("camera {0} already exists")]
    DuplicateCamera(String),
}

impl VisionError {
    pub fn acquisition(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn detection(frame_id: u64, msg: impl Into<String>) -> Self {
        Self::Detection {
            frame_id,
            message: msg.into(),
        }
    }
}

/// Returns the taxonomy entry carried by an `anyhow::Error`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&VisionError> {
    err.chain().find_map(|cause| cause.downcast_ref::<VisionError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_wrapped_error() {
        let err: anyhow::Result<()> =
            Err(VisionError::config("zone needs 3 points")).context("add camera cam1");
        let err = err.unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(VisionError::Configuration(msg)) if msg.contains("3 points")
        ));
    }

    #[test]
    fn classify_ignores_plain_errors() {
        let err = anyhow::anyhow!("plain failure");
        assert!(classify(&err).is_none());
    }
}
