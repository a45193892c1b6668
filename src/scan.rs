//
// scan.rs
// Dicom-Prep-rs
//
// Lazy, read-only classification of a directory tree into DICOM images, DICOMDIR indexes and PNG renderings.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PrepError;

/// Name every DICOM media index carries on disk.
pub const DICOMDIR: &str = "DICOMDIR";

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum FileKind {
    DicomImage,
    DicomDir,
    Png,
}

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub kind: FileKind,
}

/// A path the scanner could not read. The scan itself keeps going.
#[derive(Debug)]
pub struct ScanError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ScanError {}

/// Walk `root` lazily, yielding every classified file. Files of other kinds are skipped.
pub fn scan(root: &Path) -> impl Iterator<Item = Result<ScanEntry, ScanError>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => {
                if !entry.file_type().is_file() {
                    return None;
                }
                let path = entry.into_path();
                match classify(&path) {
                    Ok(Some(kind)) => Some(Ok(ScanEntry { path, kind })),
                    Ok(None) => None,
                    Err(e) => Some(Err(ScanError {
                        path: Some(path),
                        message: e.to_string(),
                    })),
                }
            }
            Err(e) => Some(Err(ScanError {
                path: e.path().map(Path::to_path_buf),
                message: e.to_string(),
            })),
        })
}

/// Classify a single file. `Ok(None)` means "not something we care about".
pub fn classify(path: &Path) -> std::io::Result<Option<FileKind>> {
    if path.file_name().map_or(false, |n| n == DICOMDIR) {
        return Ok(Some(FileKind::DicomDir));
    }
    if has_extension(path, "png") {
        return Ok(Some(FileKind::Png));
    }
    if has_dicom_magic(path)? {
        return Ok(Some(FileKind::DicomImage));
    }
    Ok(None)
}

/// True when `path` is a DICOM image (DICOMDIR files and directories are not).
pub fn is_dicom(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Err(PrepError::InvalidPath(path.to_path_buf()).into());
    }
    if path.is_dir() {
        return Ok(false);
    }
    Ok(classify(path)? == Some(FileKind::DicomImage))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

fn has_dicom_magic(path: &Path) -> std::io::Result<bool> {
    let mut head = [0u8; PREAMBLE_LEN + 4];
    let mut file = File::open(path)?;
    let mut read = 0;
    // Short files simply are not DICOM; keep reading until the buffer is full or EOF.
    while read < head.len() {
        let n = file.read(&mut head[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(&head[PREAMBLE_LEN..] == MAGIC)
}

fn collect(root: &Path, wanted: FileKind) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for item in scan(root) {
        match item {
            Ok(entry) if entry.kind == wanted => found.push(entry.path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path: {}", e),
        }
    }
    found
}

/// All DICOM images under `root`, DICOMDIR excluded.
pub fn find_dicom(root: &Path) -> Vec<PathBuf> {
    let found = collect(root, FileKind::DicomImage);
    debug!("Found {} DICOM images under {:?}", found.len(), root);
    found
}

/// Directories under `root` that contain a DICOMDIR file.
pub fn find_dicomdirs(root: &Path) -> Vec<PathBuf> {
    collect(root, FileKind::DicomDir)
        .into_iter()
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .collect()
}

/// PNG files under `root`, optionally keeping only names containing `contains` (case-insensitive).
pub fn find_png(root: &Path, contains: Option<&str>) -> Vec<PathBuf> {
    let needle = contains.map(str::to_lowercase);
    collect(root, FileKind::Png)
        .into_iter()
        .filter(|p| match &needle {
            Some(n) => p
                .file_name()
                .map_or(false, |f| f.to_string_lossy().to_lowercase().contains(n)),
            None => true,
        })
        .collect()
}
