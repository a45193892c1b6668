//
// preprocess.rs
// Dicom-Prep-rs
//
// Validates and repairs the patient tree, then anonymizes, converts and restructures every patient before selecting the T1 sequences.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::alias::{AliasStore, FixedAlias};
use crate::convert::{self, Converter, PngExportOptions};
use crate::decompress::Decompressor;
use crate::error::PrepError;
use crate::models::{ConversionReport, PreprocessReport};
use crate::scan::{self, DICOMDIR};

pub const PATIENT_ALIASES: &str = "patient aliases.txt";
pub const FAILED_DICOM: &str = "failed dicom.txt";
pub const DEFAULT_MARKER: &str = "t1";

/// Directory names of the canonical patient layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Where a patient's converted image sequence ends up.
    pub sequence_dir: String,
    /// Where a patient's single images live (DaT scans).
    pub singles_dir: String,
    /// Per-group directory under the selection destination.
    pub selection_subdir: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            sequence_dir: "1.MRI".to_string(),
            singles_dir: "0.DaT".to_string(),
            selection_subdir: "MRI".to_string(),
        }
    }
}

impl Layout {
    /// Whitespace and case are ignored, so `0. dat` still names the singles directory.
    pub fn is_singles_dir(&self, name: &str) -> bool {
        squash(name).eq_ignore_ascii_case(&squash(&self.singles_dir))
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub layout: Layout,
    pub log_dir: PathBuf,
    pub selection_dir: PathBuf,
    pub marker: String,
    pub decompressor: Decompressor,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            log_dir: PathBuf::from("logs"),
            selection_dir: PathBuf::from("selection"),
            marker: DEFAULT_MARKER.to_string(),
            decompressor: Decompressor::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IssueKind {
    /// Neither a DICOMDIR nor any DICOM image.
    MissingDicomDir,
    DicomWithoutDicomDir,
    MultipleDicomDirs,
    DicomDirWithoutImages,
    /// A DICOMDIR or DICOM images inside the singles directory.
    SingleImageDicomDir,
    /// The sequence DICOMDIR sits below the patient directory instead of directly in it.
    WrongDepth,
    /// A study prefix other than the canonical `D<digit>. `.
    MalformedName,
    /// Stripping the study prefix would land on an existing directory name.
    NameCollision,
}

impl IssueKind {
    pub fn fixable(self) -> bool {
        !matches!(
            self,
            IssueKind::MissingDicomDir | IssueKind::MultipleDicomDirs | IssueKind::NameCollision
        )
    }

    /// Patients carrying the issue cannot be converted. Loose images without an index are
    /// still converted, just without a conversion log.
    pub fn blocks_conversion(self) -> bool {
        self != IssueKind::DicomWithoutDicomDir
    }

    fn describe(self) -> &'static str {
        match self {
            IssueKind::MissingDicomDir => "no DICOMDIR and no DICOM images",
            IssueKind::DicomWithoutDicomDir => "DICOM images without a DICOMDIR",
            IssueKind::MultipleDicomDirs => "multiple DICOMDIR files",
            IssueKind::DicomDirWithoutImages => "DICOMDIR without DICOM images",
            IssueKind::SingleImageDicomDir => "DICOM files in the single image directory",
            IssueKind::WrongDepth => "wrong directory structure",
            IssueKind::MalformedName => "possibly wrong directory name",
            IssueKind::NameCollision => "directory name collides once the study prefix is removed",
        }
    }
}

/// A structural problem of one patient directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub patient: PathBuf,
    /// The offending directory: the patient itself or a subdirectory of it.
    pub path: PathBuf,
}

impl Issue {
    fn new(kind: IssueKind, patient: &Path, path: &Path) -> Self {
        Self {
            kind,
            patient: patient.to_path_buf(),
            path: path.to_path_buf(),
        }
    }

    pub fn fixable(&self) -> bool {
        self.kind.fixable()
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.kind.describe())
    }
}

/// Strip a leading study prefix (`D1. `, `D1a `, `D.`). A bare `D` only counts when a digit or a dot follows it.
pub fn strip_study_prefix(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('D')?;
    let mut chars = rest.char_indices().peekable();
    let mut end = 0;
    let mut marked = false;

    if let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() {
            marked = true;
            end = i + c.len_utf8();
            chars.next();
            if let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_lowercase() {
                    end = i + c.len_utf8();
                    chars.next();
                }
            }
        }
    }
    if let Some(&(i, '.')) = chars.peek() {
        marked = true;
        end = i + 1;
        chars.next();
    }
    if !marked {
        return None;
    }
    if let Some(&(i, ' ')) = chars.peek() {
        end = i + 1;
    }

    let stripped = &rest[end..];
    (!stripped.is_empty()).then_some(stripped)
}

/// `D<digit>. <name>`
pub fn is_canonical_name(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() > 4 && b[0] == b'D' && b[1].is_ascii_digit() && b[2] == b'.' && b[3] == b' '
}

/// Look for structural problems in every `root/<group>/<patient>` directory.
pub fn check(root: &Path, layout: &Layout) -> Result<Vec<Issue>> {
    if !root.is_dir() {
        return Err(PrepError::InvalidPath(root.to_path_buf()).into());
    }
    info!("Performing a preliminary check of {:?}", root);

    let mut issues = Vec::new();
    for group in list_dirs(root)? {
        let patients = list_dirs(&group)?;
        // How many siblings end up with each name once prefixes are gone.
        let mut targets: HashMap<String, usize> = HashMap::new();
        for patient in &patients {
            let name = dir_name(patient);
            let target = strip_study_prefix(&name).unwrap_or(&name).to_string();
            *targets.entry(target).or_default() += 1;
        }

        debug!("Checking {} patient(s) in {:?}", patients.len(), group);
        for patient in &patients {
            check_patient(patient, layout, &targets, &mut issues);
        }
    }

    info!("Preliminary check found {} issue(s)", issues.len());
    Ok(issues)
}

fn check_patient(
    patient: &Path,
    layout: &Layout,
    targets: &HashMap<String, usize>,
    issues: &mut Vec<Issue>,
) {
    let singles = singles_dirs(patient, layout);
    for dir in &singles {
        if !scan::find_dicomdirs(dir).is_empty() || !scan::find_dicom(dir).is_empty() {
            issues.push(Issue::new(IssueKind::SingleImageDicomDir, patient, dir));
        }
    }
    let outside_singles = |p: &Path| !singles.iter().any(|s| p.starts_with(s));

    let mut sequence = Vec::new();
    for dir in scan::find_dicomdirs(patient) {
        if !outside_singles(&dir) {
            continue;
        }
        if scan::find_dicom(&dir).iter().any(|p| outside_singles(p)) {
            sequence.push(dir);
        } else {
            debug!("DICOMDIR in {:?} indexes no DICOM images", dir);
            issues.push(Issue::new(IssueKind::DicomDirWithoutImages, patient, &dir));
        }
    }

    match sequence.as_slice() {
        [] => {
            let loose = scan::find_dicom(patient)
                .iter()
                .any(|p| outside_singles(p));
            if loose {
                issues.push(Issue::new(IssueKind::DicomWithoutDicomDir, patient, patient));
            } else if !patient.join(&layout.sequence_dir).is_dir() {
                issues.push(Issue::new(IssueKind::MissingDicomDir, patient, patient));
            }
        }
        [dir] => {
            if dir != patient {
                issues.push(Issue::new(IssueKind::WrongDepth, patient, dir));
            }
        }
        _ => issues.push(Issue::new(IssueKind::MultipleDicomDirs, patient, patient)),
    }

    let name = dir_name(patient);
    if let Some(stripped) = strip_study_prefix(&name) {
        if targets.get(stripped).copied().unwrap_or(0) > 1 {
            issues.push(Issue::new(IssueKind::NameCollision, patient, patient));
        } else if !is_canonical_name(&name) {
            issues.push(Issue::new(IssueKind::MalformedName, patient, patient));
        }
    }
}

/// Repair every fixable issue, then strip the study prefix of every patient directory.
/// Returns the issues that need manual intervention.
pub fn fix(root: &Path, issues: Vec<Issue>, options: &PreprocessOptions) -> Result<Vec<Issue>> {
    let mut remaining = Vec::new();
    for issue in issues {
        if !issue.fixable() {
            remaining.push(issue);
            continue;
        }
        // The renaming pass below covers these.
        if issue.kind == IssueKind::MalformedName {
            continue;
        }
        match apply_fix(&issue, options) {
            Ok(()) => info!("Fixed {}", issue),
            Err(e) => {
                error!("Could not fix {}: {:#}", issue, e);
                remaining.push(issue);
            }
        }
    }

    let collisions: HashSet<PathBuf> = remaining
        .iter()
        .filter(|i| i.kind == IssueKind::NameCollision)
        .map(|i| i.patient.clone())
        .collect();

    for group in list_dirs(root)? {
        for patient in list_dirs(&group)? {
            if collisions.contains(&patient) {
                continue;
            }
            let name = dir_name(&patient);
            let Some(stripped) = strip_study_prefix(&name) else {
                continue;
            };
            let target = group.join(stripped);
            if target.exists() {
                warn!("Cannot rename {:?}: {:?} already exists", patient, target);
                remaining.push(Issue::new(IssueKind::NameCollision, &patient, &patient));
                continue;
            }
            if let Err(e) = fs::rename(&patient, &target) {
                error!("Could not rename {:?} to {:?}: {}", patient, target, e);
                remaining.push(Issue::new(IssueKind::MalformedName, &patient, &patient));
                continue;
            }
            debug!("Renaming {:<30} to {}", name, stripped);
            for issue in remaining.iter_mut().filter(|i| i.patient == patient) {
                if let Ok(rel) = issue.path.strip_prefix(&patient) {
                    issue.path = target.join(rel);
                }
                issue.patient = target.clone();
            }
        }
    }

    Ok(remaining)
}

fn apply_fix(issue: &Issue, options: &PreprocessOptions) -> Result<()> {
    match issue.kind {
        IssueKind::DicomWithoutDicomDir => {
            debug!("{:?} will be converted without a conversion log", issue.patient);
            Ok(())
        }
        IssueKind::DicomDirWithoutImages => {
            let dicomdir = issue.path.join(DICOMDIR);
            fs::remove_file(&dicomdir).with_context(|| format!("Failed to remove {:?}", dicomdir))
        }
        IssueKind::SingleImageDicomDir => convert_singles(issue, options),
        IssueKind::WrongDepth => {
            let target = issue.patient.join(DICOMDIR);
            if target.exists() {
                return Err(PrepError::Layout {
                    path: issue.patient.clone(),
                    reason: "a DICOMDIR already exists in the patient directory".to_string(),
                }
                .into());
            }
            debug!("Moving DICOMDIR from {:?} to {:?}", issue.path, issue.patient);
            fs::rename(issue.path.join(DICOMDIR), &target)
                .with_context(|| format!("Failed to move DICOMDIR into {:?}", issue.patient))
        }
        IssueKind::MissingDicomDir
        | IssueKind::MultipleDicomDirs
        | IssueKind::MalformedName
        | IssueKind::NameCollision => Ok(()),
    }
}

/// Convert single images in place under their own names, then drop everything but the PNGs.
fn convert_singles(issue: &Issue, options: &PreprocessOptions) -> Result<()> {
    let dir = &issue.path;
    if !scan::find_dicom(dir).is_empty() {
        let converter = Converter::new(
            PngExportOptions {
                same_name: true,
                cleanup: true,
                log_dir: None,
            },
            options.decompressor.clone(),
        );
        let mut pseudonymizer = FixedAlias(dir_name(&issue.patient));
        let report = converter.convert_patient(dir, &mut pseudonymizer, None)?;
        info!(
            "{:<40} {}",
            "DICOM images converted to png:", report.successful
        );
        if report.failed > 0 {
            return Err(PrepError::Layout {
                path: dir.clone(),
                reason: format!("{} single image(s) failed to convert", report.failed),
            }
            .into());
        }
    }
    remove_except(dir, is_png)?;
    Ok(())
}

/// Check, fix, then anonymize, convert and restructure every patient. Ends with [`select`].
pub fn run(
    root: &Path,
    store: &mut AliasStore,
    options: &PreprocessOptions,
) -> Result<PreprocessReport> {
    let layout = &options.layout;
    let issues = check(root, layout)?;
    let remaining = fix(root, issues, options)?;
    if !remaining.is_empty() {
        warn!("{} issue(s) need manual intervention", remaining.len());
    }

    // Fixes can uncover new problems, so decide on a fresh check.
    let blocked: HashSet<PathBuf> = check(root, layout)?
        .into_iter()
        .filter(|i| i.kind.blocks_conversion())
        .map(|i| i.patient)
        .collect();

    fs::create_dir_all(&options.log_dir)
        .with_context(|| format!("Failed to create {:?}", options.log_dir))?;
    let converter = Converter::new(
        PngExportOptions {
            same_name: false,
            cleanup: true,
            log_dir: Some(options.log_dir.clone()),
        },
        options.decompressor.clone(),
    );

    let mut report = PreprocessReport {
        previous_entries: store.previous_entries(),
        ..Default::default()
    };
    let before = store.len();

    for group in list_dirs(root)? {
        for patient in list_dirs(&group)? {
            if blocked.contains(&patient) {
                warn!("Skipping {:?}, its issues are unresolved", patient);
                report.skipped_patients.push(patient);
                continue;
            }
            let name = dir_name(&patient);
            if store.is_alias(&name) && patient.join(&layout.sequence_dir).is_dir() {
                debug!("{:?} is already preprocessed", patient);
                continue;
            }

            // A directory already carrying an alias was renamed on an earlier pass.
            let alias = if store.is_alias(&name) {
                name
            } else {
                store.resolve(&name)
            };
            match process_patient(&converter, &patient, &alias, layout) {
                Ok(r) => report.conversion.merge(r),
                Err(e) => {
                    error!("Skipping patient {:?}: {:#}", patient, e);
                    report.skipped_patients.push(patient);
                }
            }
        }
    }
    report.anonymized = store.len() - before;
    report.alias_collisions = store.collisions().len();

    store.flush()?;
    store.write_alias_table(&options.log_dir.join(PATIENT_ALIASES))?;
    if !report.conversion.failures.is_empty() {
        write_failed_list(&options.log_dir, &report.conversion.failures)?;
    }
    if !report.conversion.compressed.is_empty() {
        convert::write_compressed_list(&options.log_dir, &report.conversion.compressed)?;
    }

    report.selected_images = select(root, &options.marker, &options.selection_dir, layout)?;
    Ok(report)
}

/// Convert, restructure and rename one patient directory to its alias.
fn process_patient(
    converter: &Converter,
    patient: &Path,
    alias: &str,
    layout: &Layout,
) -> Result<ConversionReport> {
    let target = patient.with_file_name(alias);
    if target != patient && target.exists() {
        return Err(PrepError::Layout {
            path: patient.to_path_buf(),
            reason: format!("{:?} already exists", target),
        }
        .into());
    }

    let mut pseudonymizer = FixedAlias(alias.to_string());
    let report = converter.convert_patient(patient, &mut pseudonymizer, None)?;
    let moved = structure_patient(patient, layout)?;
    info!("Moved {} images in {}/{}", moved, alias, layout.sequence_dir);

    if target != patient {
        fs::rename(patient, &target)
            .with_context(|| format!("Failed to rename {:?} to {}", patient, alias))?;
    }
    Ok(report)
}

/// Remove every leftover of the conversion and gather the PNGs into the sequence directory.
fn structure_patient(patient: &Path, layout: &Layout) -> Result<usize> {
    debug!("Removing all irrelevant files and directories in {:?}", patient);
    remove_except(patient, |entry| {
        is_png(entry)
            || (entry.is_dir()
                && entry
                    .file_name()
                    .map_or(false, |n| layout.is_singles_dir(&n.to_string_lossy())))
    })?;

    let sequence = patient.join(&layout.sequence_dir);
    fs::create_dir_all(&sequence).with_context(|| format!("Failed to create {:?}", sequence))?;
    let mut moved = 0;
    for entry in fs::read_dir(patient).with_context(|| format!("Failed to list {:?}", patient))? {
        let path = entry?.path();
        if !is_png(&path) {
            continue;
        }
        if let Some(name) = path.file_name() {
            fs::rename(&path, sequence.join(name))
                .with_context(|| format!("Failed to move {:?}", path))?;
            moved += 1;
        }
    }
    Ok(moved)
}

/// Copy every image named with `marker` from each patient's sequence directory to
/// `destination/<group>/<selection_subdir>/<patient>`. Returns the number of copied images.
pub fn select(root: &Path, marker: &str, destination: &Path, layout: &Layout) -> Result<usize> {
    if !root.is_dir() {
        return Err(PrepError::InvalidPath(root.to_path_buf()).into());
    }
    if destination.exists() && !destination.is_dir() {
        return Err(PrepError::InvalidPath(destination.to_path_buf()).into());
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create {:?}", destination))?;
    let destination_real = fs::canonicalize(destination)?;

    let mut copied = 0;
    for group in list_dirs(root)? {
        if fs::canonicalize(&group)? == destination_real {
            continue;
        }
        for patient in list_dirs(&group)? {
            let sequence = patient.join(&layout.sequence_dir);
            if !sequence.is_dir() {
                continue;
            }
            let images = scan::find_png(&sequence, Some(marker));
            if images.is_empty() {
                info!("No {} images for {}", marker, dir_name(&patient));
                continue;
            }

            let target = destination
                .join(dir_name(&group))
                .join(&layout.selection_subdir)
                .join(dir_name(&patient));
            fs::create_dir_all(&target).with_context(|| format!("Failed to create {:?}", target))?;
            debug!("Copying images to {:?}", target);
            for image in images {
                let Some(name) = image.file_name() else {
                    continue;
                };
                fs::copy(&image, target.join(name))
                    .with_context(|| format!("Failed to copy {:?}", image))?;
                copied += 1;
            }
        }
    }

    let total = scan::find_png(destination, None).len();
    if copied == 0 {
        warn!("{} images found but no images were copied", total);
    } else if total != copied {
        warn!("{} images found but only {} images copied", total, copied);
    }
    Ok(copied)
}

pub fn print_issues(issues: &[Issue]) {
    if issues.is_empty() {
        println!("No structural issues found.");
        return;
    }
    let mut by_kind: Vec<(IssueKind, Vec<&Issue>)> = Vec::new();
    for issue in issues {
        match by_kind.iter_mut().find(|(k, _)| *k == issue.kind) {
            Some((_, list)) => list.push(issue),
            None => by_kind.push((issue.kind, vec![issue])),
        }
    }
    for (kind, list) in by_kind {
        let fixable = if kind.fixable() { "fixable" } else { "manual" };
        println!("{} ({}):", kind.describe(), fixable);
        for (i, issue) in list.iter().enumerate() {
            println!("{:<3} {}", format!("{}.", i + 1), issue.path.display());
        }
        println!();
    }
}

pub fn print_report(report: &PreprocessReport) {
    println!("\n------------------ REPORT -------------------");
    if report.previous_entries > 0 {
        println!("{:<40} {}", "Previous entries:", report.previous_entries);
    }
    println!("{:<40} {}", "Patients anonymized:", report.anonymized);
    if report.previous_entries > 0 {
        println!(
            "{:<40} {}",
            "Dictionary's total entries:",
            report.previous_entries + report.anonymized
        );
    }
    if report.alias_collisions > 0 {
        println!("{:<40} {}", "Near-duplicate identifiers:", report.alias_collisions);
    }
    println!("{:<40} {}", "DICOM images converted to png:", report.conversion.successful);
    if report.conversion.failed > 0 {
        println!("{:<40} {}", "DICOM images failed to convert:", report.conversion.failed);
    }
    if !report.skipped_patients.is_empty() {
        println!("{:<40} {}", "Patients skipped:", report.skipped_patients.len());
    }
    println!("{:<40} {}", "Images selected:", report.selected_images);
    println!();
}

fn write_failed_list(log_dir: &Path, files: &[PathBuf]) -> Result<()> {
    let mut out = String::from("DICOM images that failed to convert:\n");
    for f in files {
        let _ = writeln!(out, "{}", f.display());
    }
    let path = log_dir.join(FAILED_DICOM);
    fs::write(&path, out).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

fn remove_except(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        if keep(&path) {
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.with_context(|| format!("Failed to remove {:?}", path))?;
    }
    Ok(())
}

fn singles_dirs(patient: &Path, layout: &Layout) -> Vec<PathBuf> {
    WalkDir::new(patient)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| layout.is_singles_dir(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect()
}

/// Sorted, non-hidden subdirectories.
pub(crate) fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to list {:?}", path))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !dir_name(p).starts_with('.'))
        .collect();
    dirs.sort();
    Ok(dirs)
}

pub(crate) fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_png(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map_or(false, |e| e.eq_ignore_ascii_case("png"))
}

fn squash(name: &str) -> String {
    name.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_dicom(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(path, bytes).unwrap();
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn kinds(issues: &[Issue]) -> Vec<IssueKind> {
        issues.iter().map(|i| i.kind).collect()
    }

    #[test]
    fn study_prefixes_are_recognized() {
        assert_eq!(strip_study_prefix("D1. Doe John"), Some("Doe John"));
        assert_eq!(strip_study_prefix("D1a Doe John"), Some("Doe John"));
        assert_eq!(strip_study_prefix("D.Doe John"), Some("Doe John"));
        assert_eq!(strip_study_prefix("D1 Doe"), Some("Doe"));
        assert_eq!(strip_study_prefix("Doe John"), None);
        assert_eq!(strip_study_prefix("Subject3"), None);
        assert_eq!(strip_study_prefix("D1."), None);

        assert!(is_canonical_name("D1. Doe John"));
        assert!(!is_canonical_name("D1 Doe John"));
        assert!(!is_canonical_name("D.Doe John"));
    }

    #[test]
    fn singles_dir_name_ignores_case_and_spaces() {
        let layout = Layout::default();
        assert!(layout.is_singles_dir("0.DaT"));
        assert!(layout.is_singles_dir("0. dat"));
        assert!(!layout.is_singles_dir("1.MRI"));
    }

    #[test]
    fn check_reports_each_structural_issue() {
        let dir = tempdir().expect("tmpdir");
        let group = dir.path().join("NPD");
        let layout = Layout::default();

        fs::create_dir_all(group.join("D1. Empty")).unwrap();
        fake_dicom(&group.join("D2. Loose").join("IM0001"));
        touch(&group.join("D3. Many").join("a").join(DICOMDIR));
        fake_dicom(&group.join("D3. Many").join("a").join("IM0001"));
        touch(&group.join("D3. Many").join("b").join(DICOMDIR));
        fake_dicom(&group.join("D3. Many").join("b").join("IM0001"));
        touch(&group.join("D4. Deep").join("MRI").join(DICOMDIR));
        fake_dicom(&group.join("D4. Deep").join("MRI").join("IM0001"));
        touch(&group.join("D5. Dat").join(DICOMDIR));
        fake_dicom(&group.join("D5. Dat").join("IM0001"));
        touch(&group.join("D5. Dat").join("0.DaT").join(DICOMDIR));

        let issues = check(dir.path(), &layout).expect("check");
        let find = |name: &str| -> Vec<IssueKind> {
            issues
                .iter()
                .filter(|i| i.patient.ends_with(name))
                .map(|i| i.kind)
                .collect()
        };
        assert_eq!(find("D1. Empty"), vec![IssueKind::MissingDicomDir]);
        assert_eq!(find("D2. Loose"), vec![IssueKind::DicomWithoutDicomDir]);
        assert_eq!(find("D3. Many"), vec![IssueKind::MultipleDicomDirs]);
        assert_eq!(find("D4. Deep"), vec![IssueKind::WrongDepth]);
        assert_eq!(find("D5. Dat"), vec![IssueKind::SingleImageDicomDir]);
    }

    #[test]
    fn dicomdir_without_images_and_names_are_flagged() {
        let dir = tempdir().expect("tmpdir");
        let group = dir.path().join("PD");
        touch(&group.join("D1 Index").join(DICOMDIR));
        fake_dicom(&group.join("D1 Index").join("scans").join("IM0001"));
        touch(&group.join("D1 Index").join("scans").join("old").join(DICOMDIR));
        touch(&group.join("D2. Roe").join(DICOMDIR));
        fake_dicom(&group.join("D2. Roe").join("IM0001"));
        touch(&group.join("Roe").join(DICOMDIR));
        fake_dicom(&group.join("Roe").join("IM0001"));

        let issues = check(dir.path(), &Layout::default()).expect("check");
        let index: Vec<_> = issues
            .iter()
            .filter(|i| i.patient.ends_with("D1 Index"))
            .map(|i| i.kind)
            .collect();
        assert_eq!(
            index,
            vec![IssueKind::DicomDirWithoutImages, IssueKind::MalformedName]
        );
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::NameCollision && i.patient.ends_with("D2. Roe")));
        // Path::ends_with matches whole components, so this is the plain `Roe` directory only.
        assert!(!issues.iter().any(|i| i.patient.ends_with("Roe")));
    }

    #[test]
    fn empty_index_is_removed_by_fix() {
        let dir = tempdir().expect("tmpdir");
        let patient = dir.path().join("NPD").join("Doe");
        touch(&patient.join(DICOMDIR));
        fake_dicom(&patient.join("IM0001"));
        touch(&patient.join("stale").join(DICOMDIR));

        let issues = check(dir.path(), &Layout::default()).expect("check");
        assert_eq!(kinds(&issues), vec![IssueKind::DicomDirWithoutImages]);

        let remaining = fix(dir.path(), issues, &PreprocessOptions::default()).expect("fix");
        assert!(remaining.is_empty());
        assert!(!patient.join("stale").join(DICOMDIR).exists());
        assert!(check(dir.path(), &Layout::default()).unwrap().is_empty());
    }

    #[test]
    fn fix_moves_dicomdir_up_and_strips_prefixes() {
        let dir = tempdir().expect("tmpdir");
        let group = dir.path().join("NPD");
        touch(&group.join("D4. Deep").join("MRI").join(DICOMDIR));
        fake_dicom(&group.join("D4. Deep").join("MRI").join("IM0001"));
        touch(&group.join("D1a Doe").join(DICOMDIR));
        fake_dicom(&group.join("D1a Doe").join("IM0001"));
        fs::create_dir_all(group.join("D9. Nobody")).unwrap();

        let issues = check(dir.path(), &Layout::default()).expect("check");
        let remaining = fix(dir.path(), issues, &PreprocessOptions::default()).expect("fix");

        assert_eq!(kinds(&remaining), vec![IssueKind::MissingDicomDir]);
        assert!(remaining[0].patient.ends_with("Nobody"));
        assert!(group.join("Deep").join(DICOMDIR).is_file());
        assert!(!group.join("Deep").join("MRI").join(DICOMDIR).exists());
        assert!(group.join("Doe").join(DICOMDIR).is_file());
        assert!(check(dir.path(), &Layout::default())
            .unwrap()
            .iter()
            .all(|i| i.patient.ends_with("Nobody")));
    }

    #[test]
    fn collisions_are_left_alone() {
        let dir = tempdir().expect("tmpdir");
        let group = dir.path().join("PD");
        touch(&group.join("D2. Roe").join(DICOMDIR));
        fake_dicom(&group.join("D2. Roe").join("IM0001"));
        touch(&group.join("Roe").join(DICOMDIR));
        fake_dicom(&group.join("Roe").join("IM0001"));

        let issues = check(dir.path(), &Layout::default()).expect("check");
        let remaining = fix(dir.path(), issues, &PreprocessOptions::default()).expect("fix");
        assert_eq!(kinds(&remaining), vec![IssueKind::NameCollision]);
        assert!(group.join("D2. Roe").is_dir());
    }

    #[test]
    fn structure_keeps_pngs_and_singles() {
        let dir = tempdir().expect("tmpdir");
        let patient = dir.path().join("Doe");
        touch(&patient.join("t1_001.png"));
        touch(&patient.join("t1_002.png"));
        touch(&patient.join(DICOMDIR));
        touch(&patient.join("DICOM").join("IM0001"));
        touch(&patient.join("0.DaT").join("dat.png"));

        let moved = structure_patient(&patient, &Layout::default()).expect("structure");
        assert_eq!(moved, 2);
        assert!(patient.join("1.MRI").join("t1_001.png").is_file());
        assert!(patient.join("0.DaT").join("dat.png").is_file());
        assert!(!patient.join(DICOMDIR).exists());
        assert!(!patient.join("DICOM").exists());
    }

    #[test]
    fn select_copies_marked_images_per_group() {
        let dir = tempdir().expect("tmpdir");
        let root = dir.path().join("data");
        touch(&root.join("NPD").join("Subject1").join("1.MRI").join("T1_SAG_001.png"));
        touch(&root.join("NPD").join("Subject1").join("1.MRI").join("T2_TRA_001.png"));
        touch(&root.join("PD").join("Subject2").join("1.MRI").join("t1_mpr_001.png"));
        touch(&root.join("PD").join("Subject2").join("0.DaT").join("t1_dat.png"));
        let destination = dir.path().join("selection");

        let copied = select(&root, DEFAULT_MARKER, &destination, &Layout::default()).expect("select");
        assert_eq!(copied, 2);
        assert!(destination
            .join("NPD")
            .join("MRI")
            .join("Subject1")
            .join("T1_SAG_001.png")
            .is_file());
        assert!(destination
            .join("PD")
            .join("MRI")
            .join("Subject2")
            .join("t1_mpr_001.png")
            .is_file());
    }

    #[test]
    fn select_rejects_a_file_destination() {
        let dir = tempdir().expect("tmpdir");
        let file = dir.path().join("selection");
        fs::write(&file, b"x").unwrap();
        assert!(select(dir.path(), "t1", &file, &Layout::default()).is_err());
    }
}
