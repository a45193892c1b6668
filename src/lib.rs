//
// lib.rs
// Dicom-Prep-rs
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Public surface of the library: each module mirrors a pipeline stage or shared utility.
pub mod alias;
pub mod anonymize;
pub mod augment;
pub mod cli;
pub mod convert;
pub mod decompress;
pub mod dicom_access;
pub mod error;
pub mod metadata;
pub mod models;
pub mod preprocess;
pub mod scan;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::PrepError;
