//
// error.rs
// Dicom-Prep-rs
//
// Typed failures shared by the pipeline stages; the CLI layer wraps them in anyhow with context.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepError {
    /// The external decompression tool could not be spawned.
    #[error("decompression tool `{tool}` is not installed or not on PATH")]
    ToolMissing { tool: String },

    #[error("`{tool}` exited with {status} while decompressing {path:?}")]
    ToolFailed {
        tool: String,
        path: PathBuf,
        status: String,
    },

    #[error("cannot decode the pixel data of {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("invalid path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("alias store {path:?}: {reason}")]
    Store { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{path:?} has no {attribute} attribute")]
    MissingAttribute {
        path: PathBuf,
        attribute: &'static str,
    },

    #[error("unexpected directory layout under {path:?}: {reason}")]
    Layout { path: PathBuf, reason: String },
}
