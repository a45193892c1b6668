//
// models.rs
// Dicom-Prep-rs
//
// Serializable reports and summaries produced by the conversion, preprocessing and dataset stages.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metadata carried alongside a PNG rendering. Patient fields already hold the alias.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageMetadata {
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<String>,
    pub modality: Option<String>,
    pub series_description: Option<String>,
    pub series_number: Option<u32>,
    pub instance_number: Option<u32>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    pub number_of_frames: u32,
    pub photometric_interpretation: Option<String>,
    pub transfer_syntax: Option<String>,
}

/// Totals of a conversion pass over one or more patients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionReport {
    pub successful: usize,
    pub failed: usize,
    /// Extra PNGs produced by multi-frame objects beyond the first frame.
    pub extra_frames: usize,
    pub removed: usize,
    pub compressed: Vec<PathBuf>,
    pub failures: Vec<PathBuf>,
}

impl ConversionReport {
    pub fn attempted(&self) -> usize {
        self.successful + self.failed
    }

    pub fn png_created(&self) -> usize {
        self.successful + self.extra_frames
    }

    pub fn merge(&mut self, other: ConversionReport) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.extra_frames += other.extra_frames;
        self.removed += other.removed;
        self.compressed.extend(other.compressed);
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompressReport {
    pub examined: usize,
    pub decompressed: usize,
    pub already_native: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessReport {
    pub previous_entries: usize,
    pub anonymized: usize,
    /// New identifiers that differ from a known one only by case or spacing.
    pub alias_collisions: usize,
    pub conversion: ConversionReport,
    pub skipped_patients: Vec<PathBuf>,
    pub selected_images: usize,
}

/// Per label group counts in a generated dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupSummary {
    pub label: u8,
    pub subjects: usize,
    pub sequence_images: usize,
    pub single_images: usize,
    pub windows: usize,
    pub pairings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub window: usize,
    pub ratio: f64,
    pub seed: u64,
    pub groups: Vec<GroupSummary>,
    pub train: usize,
    pub test: usize,
    /// The ratio actually achieved after rounding.
    pub achieved_ratio: f64,
}
