//
// augment.rs
// Dicom-Prep-rs
//
// Builds labeled train/test sets by pairing sliding windows of each subject's image sequence with that subject's single images.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PrepError;
use crate::models::{DatasetSummary, GroupSummary};
use crate::preprocess::{dir_name, list_dirs, Layout};
use crate::scan;

pub const TRAIN_FILE: &str = "train.txt";
pub const TEST_FILE: &str = "test.txt";
pub const SUMMARY_FILE: &str = "summary.json";

/// One slot of a flat, separator-delimited sequence listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceEntry<T> {
    Image(T),
    Separator,
}

/// Split a flat listing into per-subject runs. Separators never end up inside a run.
pub fn partition_runs<T: Clone>(entries: &[SequenceEntry<T>]) -> Vec<Vec<T>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for entry in entries {
        match entry {
            SequenceEntry::Image(item) => current.push(item.clone()),
            SequenceEntry::Separator => {
                if !current.is_empty() {
                    runs.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Contiguous windows of `size` over one run: `len - size + 1` of them, none when the run is shorter.
pub fn windows<T>(run: &[T], size: usize) -> Vec<&[T]> {
    if size == 0 {
        return Vec::new();
    }
    run.windows(size).collect()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Negative,
    Positive,
}

impl Label {
    pub fn value(self) -> u8 {
        match self {
            Label::Negative => 0,
            Label::Positive => 1,
        }
    }
}

/// The images of one subject: its ordered sequence and its single images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectImages {
    pub subject: String,
    pub sequence: Vec<PathBuf>,
    pub singles: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledGroup {
    pub label: Label,
    pub subjects: Vec<SubjectImages>,
}

/// A window of sequence images combined with one single image of the same subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Pairing {
    pub subject: String,
    pub label: Label,
    pub window: Vec<PathBuf>,
    pub single: PathBuf,
}

impl Pairing {
    /// `label<TAB>window...<TAB>single`
    pub fn to_line(&self) -> String {
        let mut line = self.label.value().to_string();
        for image in &self.window {
            let _ = write!(line, "\t{}", image.display());
        }
        let _ = write!(line, "\t{}", self.single.display());
        line
    }
}

/// Every window of the subject's sequence crossed with every single image of that subject.
pub fn pair_subject(subject: &SubjectImages, label: Label, window: usize) -> Vec<Pairing> {
    let mut pairings = Vec::new();
    for w in windows(&subject.sequence, window) {
        for single in &subject.singles {
            pairings.push(Pairing {
                subject: subject.subject.clone(),
                label,
                window: w.to_vec(),
                single: single.clone(),
            });
        }
    }
    pairings
}

pub fn pair_group(group: &LabeledGroup, window: usize) -> (Vec<Pairing>, GroupSummary) {
    let mut summary = GroupSummary {
        label: group.label.value(),
        subjects: group.subjects.len(),
        ..Default::default()
    };
    let mut pairings = Vec::new();
    for subject in &group.subjects {
        summary.sequence_images += subject.sequence.len();
        summary.single_images += subject.singles.len();
        summary.windows += windows(&subject.sequence, window).len();
        if subject.singles.is_empty() || subject.sequence.len() < window {
            debug!("{} contributes no pairings", subject.subject);
        }
        pairings.extend(pair_subject(subject, group.label, window));
    }
    summary.pairings = pairings.len();
    (pairings, summary)
}

/// Pair each group on its own, then concatenate in group order.
pub fn build_pairings(groups: &[LabeledGroup], window: usize) -> (Vec<Pairing>, Vec<GroupSummary>) {
    let mut all = Vec::new();
    let mut summaries = Vec::with_capacity(groups.len());
    for group in groups {
        let (pairings, summary) = pair_group(group, window);
        all.extend(pairings);
        summaries.push(summary);
    }
    (all, summaries)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentConfig {
    pub window: usize,
    /// Share of pairings that go to the training set.
    pub ratio: f64,
    pub seed: u64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            window: 3,
            ratio: 0.75,
            seed: 0,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), PrepError> {
        if self.window == 0 {
            return Err(PrepError::InvalidConfig(
                "window size must be at least 1".to_string(),
            ));
        }
        validate_ratio(self.ratio)
    }
}

fn validate_ratio(ratio: f64) -> Result<(), PrepError> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(PrepError::InvalidConfig(format!(
            "split ratio must lie in [0, 1], got {}",
            ratio
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Split {
    pub train: Vec<Pairing>,
    pub test: Vec<Pairing>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn achieved_ratio(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.train.len() as f64 / self.len() as f64
        }
    }
}

/// Shuffle with a seeded generator, then put the first `round(len * ratio)` pairings in train.
pub fn split(mut pairings: Vec<Pairing>, ratio: f64, seed: u64) -> Result<Split> {
    validate_ratio(ratio)?;
    let mut rng = StdRng::seed_from_u64(seed);
    pairings.shuffle(&mut rng);

    let train_len = ((pairings.len() as f64 * ratio).round() as usize).min(pairings.len());
    let test = pairings.split_off(train_len);
    Ok(Split {
        train: pairings,
        test,
    })
}

/// Everything one augmentation produced.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub config: AugmentConfig,
    pub groups: Vec<GroupSummary>,
    pub split: Split,
}

impl Dataset {
    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            window: self.config.window,
            ratio: self.config.ratio,
            seed: self.config.seed,
            groups: self.groups.clone(),
            train: self.split.train.len(),
            test: self.split.test.len(),
            achieved_ratio: self.split.achieved_ratio(),
        }
    }
}

pub fn augment(groups: &[LabeledGroup], config: &AugmentConfig) -> Result<Dataset> {
    config.validate()?;
    let (pairings, summaries) = build_pairings(groups, config.window);
    log_balance(&summaries);
    let split = split(pairings, config.ratio, config.seed)?;
    info!(
        "Split {} pairings into {} train and {} test (ratio {:.5})",
        split.len(),
        split.train.len(),
        split.test.len(),
        split.achieved_ratio()
    );
    Ok(Dataset {
        config: *config,
        groups: summaries,
        split,
    })
}

fn log_balance(groups: &[GroupSummary]) {
    let total: usize = groups.iter().map(|g| g.pairings).sum();
    for g in groups {
        info!(
            "Label {}: {} subjects, {} sequence images, {} single images, {} windows, {} pairings",
            g.label, g.subjects, g.sequence_images, g.single_images, g.windows, g.pairings
        );
        if total > 0 {
            info!(
                "Label {}: {:.2}% of all pairings",
                g.label,
                100.0 * g.pairings as f64 / total as f64
            );
        }
    }
    if groups.iter().any(|g| g.pairings == 0) {
        warn!("At least one label group produced no pairings");
    }
}

/// Read the groups `root/<negative>` and `root/<positive>` of a preprocessed tree, each subject
/// contributing `<subject>/<sequence_dir>` and `<subject>/<singles_dir>` PNGs in slice order.
///
/// Subjects without a sequence directory are skipped. A group where no subject has one is
/// rejected: it is not a preprocessed tree (a selection tree, for instance, holds no singles).
pub fn discover(
    root: &Path,
    negative: &str,
    positive: &str,
    layout: &Layout,
    marker: Option<&str>,
) -> Result<Vec<LabeledGroup>> {
    let mut groups = Vec::with_capacity(2);
    for (name, label) in [(negative, Label::Negative), (positive, Label::Positive)] {
        let group_dir = root.join(name);
        if !group_dir.is_dir() {
            return Err(PrepError::InvalidPath(group_dir).into());
        }

        let mut subjects = Vec::new();
        for subject_dir in list_dirs(&group_dir)? {
            let sequence_dir = subject_dir.join(&layout.sequence_dir);
            if !sequence_dir.is_dir() {
                warn!("{:?} has no {} directory, skipping", subject_dir, layout.sequence_dir);
                continue;
            }
            let mut subject = SubjectImages {
                subject: dir_name(&subject_dir),
                sequence: scan::find_png(&sequence_dir, marker),
                ..Default::default()
            };
            for child in list_dirs(&subject_dir)? {
                if layout.is_singles_dir(&dir_name(&child)) {
                    subject.singles.extend(scan::find_png(&child, None));
                }
            }
            subject.sequence.sort_by_cached_key(|p| slice_order(p));
            subject.singles.sort_by_cached_key(|p| slice_order(p));
            debug!(
                "{}: {} sequence and {} single images",
                subject.subject,
                subject.sequence.len(),
                subject.singles.len()
            );
            subjects.push(subject);
        }
        if subjects.is_empty() {
            return Err(PrepError::Layout {
                path: group_dir,
                reason: format!(
                    "no subject holds a {} directory; run augment on the preprocessed tree",
                    layout.sequence_dir
                ),
            }
            .into());
        }
        groups.push(LabeledGroup { label, subjects });
    }
    Ok(groups)
}

/// Sort key putting `T1_SAG_999.png` before `T1_SAG_1000.png`: the stem without its numeric
/// tail, then the tail as a number. Names without a numeric tail fall back to the name.
fn slice_order(path: &Path) -> (String, Option<u64>, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let head = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = stem[head.len()..].parse::<u64>().ok();
    let prefix = if number.is_some() { head } else { stem.as_str() };
    (prefix.to_string(), number, name)
}

/// Write `train.txt`, `test.txt` and `summary.json` into `dir`.
pub fn write_dataset(dataset: &Dataset, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    write_pairings(&dir.join(TRAIN_FILE), &dataset.split.train)?;
    write_pairings(&dir.join(TEST_FILE), &dataset.split.test)?;

    let summary_path = dir.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(&dataset.summary())
        .context("Failed to serialize dataset summary")?;
    fs::write(&summary_path, json)
        .with_context(|| format!("Failed to write {:?}", summary_path))?;
    info!("Saving combinations in directory: {:?}", dir);
    Ok(())
}

fn write_pairings(path: &Path, pairings: &[Pairing]) -> Result<()> {
    let mut out = String::new();
    for p in pairings {
        out.push_str(&p.to_line());
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("Failed to write {:?}", path))
}

pub fn print_summary(summary: &DatasetSummary) {
    println!("{:^10}{:^12}{:^12}{:^12}{:^12}", "Label", "Subjects", "Windows", "Singles", "Pairings");
    for g in &summary.groups {
        println!(
            "{:^10}{:^12}{:^12}{:^12}{:^12}",
            g.label, g.subjects, g.windows, g.single_images, g.pairings
        );
    }
    let total = summary.train + summary.test;
    let negative = summary
        .groups
        .iter()
        .filter(|g| g.label == 0)
        .map(|g| g.pairings)
        .sum::<usize>();
    let positive = total.saturating_sub(negative);
    if negative > 0 {
        let rat = positive as f64 / negative as f64;
        println!("\nImbalance Ratio: 1:{:.2}", rat);
        println!("Negative: {:.2}%", 100.0 / (rat + 1.0));
        println!("Positive: {:.2}%", 100.0 * rat / (rat + 1.0));
    }
    println!(
        "\nTrain: {}  Test: {}  Exact split ratio: {:.5}",
        summary.train, summary.test, summary.achieved_ratio
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn subject(name: &str, sequence: usize, singles: usize) -> SubjectImages {
        SubjectImages {
            subject: name.to_string(),
            sequence: (1..=sequence)
                .map(|i| PathBuf::from(format!("{}/mri_{:03}.png", name, i)))
                .collect(),
            singles: (1..=singles)
                .map(|i| PathBuf::from(format!("{}/dat_{}.png", name, i)))
                .collect(),
        }
    }

    fn sample_groups() -> Vec<LabeledGroup> {
        vec![
            LabeledGroup {
                label: Label::Negative,
                subjects: vec![subject("Subject1", 6, 2), subject("Subject2", 4, 1)],
            },
            LabeledGroup {
                label: Label::Positive,
                subjects: vec![subject("Subject3", 5, 3), subject("Subject4", 2, 2)],
            },
        ]
    }

    #[test]
    fn separated_listing_yields_windows_per_run() {
        use SequenceEntry::{Image, Separator};
        let mut flat: Vec<_> = (1..=6).map(Image).collect();
        flat.push(Separator);
        flat.extend((11..=14).map(Image));

        let runs = partition_runs(&flat);
        assert_eq!(runs, vec![vec![1, 2, 3, 4, 5, 6], vec![11, 12, 13, 14]]);

        let all: Vec<Vec<i32>> = runs
            .iter()
            .flat_map(|r| windows(r, 3))
            .map(|w| w.to_vec())
            .collect();
        assert_eq!(
            all,
            vec![
                vec![1, 2, 3],
                vec![2, 3, 4],
                vec![3, 4, 5],
                vec![4, 5, 6],
                vec![11, 12, 13],
                vec![12, 13, 14],
            ]
        );
    }

    #[test]
    fn window_counts_follow_run_length() {
        let run = [1, 2, 3, 4];
        assert_eq!(windows(&run, 1).len(), 4);
        assert_eq!(windows(&run, 4).len(), 1);
        assert!(windows(&run, 5).is_empty());
        assert!(windows(&run, 0).is_empty());
        assert!(partition_runs::<i32>(&[SequenceEntry::Separator]).is_empty());
    }

    #[test]
    fn pairings_stay_within_subject_and_label() {
        let groups = sample_groups();
        let (pairings, summaries) = build_pairings(&groups, 3);

        // (6-3+1)*2 + (4-3+1)*1 + (5-3+1)*3 + 0
        assert_eq!(pairings.len(), 8 + 2 + 9);
        assert_eq!(summaries[0].pairings, 10);
        assert_eq!(summaries[1].pairings, 9);
        assert_eq!(summaries[1].windows, 3);

        for p in &pairings {
            assert_eq!(p.window.len(), 3);
            assert!(p.window.iter().all(|w| w.starts_with(&p.subject)));
            assert!(p.single.starts_with(&p.subject));
            let expected = if ["Subject1", "Subject2"].contains(&p.subject.as_str()) {
                Label::Negative
            } else {
                Label::Positive
            };
            assert_eq!(p.label, expected);
        }
    }

    #[test]
    fn subject_without_singles_contributes_nothing() {
        let s = subject("Subject9", 10, 0);
        assert!(pair_subject(&s, Label::Positive, 3).is_empty());
    }

    #[test]
    fn split_is_complete_disjoint_and_seeded() {
        let (pairings, _) = build_pairings(&sample_groups(), 3);
        let total = pairings.len();

        let a = split(pairings.clone(), 0.75, 7).expect("split");
        assert_eq!(a.train.len() + a.test.len(), total);
        assert_eq!(a.train.len(), (total as f64 * 0.75).round() as usize);

        let train: HashSet<_> = a.train.iter().collect();
        let test: HashSet<_> = a.test.iter().collect();
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), total);

        let b = split(pairings.clone(), 0.75, 7).expect("split");
        assert_eq!(a, b);

        let all_train = split(pairings.clone(), 1.0, 1).expect("split");
        assert!(all_train.test.is_empty());
        let all_test = split(pairings, 0.0, 1).expect("split");
        assert!(all_test.train.is_empty());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let bad_window = AugmentConfig {
            window: 0,
            ..Default::default()
        };
        assert!(matches!(
            bad_window.validate(),
            Err(PrepError::InvalidConfig(_))
        ));
        for ratio in [-0.1, 1.5, f64::NAN] {
            let cfg = AugmentConfig {
                ratio,
                ..Default::default()
            };
            assert!(cfg.validate().is_err());
        }
        assert!(augment(&sample_groups(), &bad_window).is_err());
    }

    #[test]
    fn discovered_tree_is_written_as_dataset() {
        let dir = tempdir().expect("tmpdir");
        let root = dir.path().join("data");
        for (group, subj, mri, dat) in [("NPD", "Subject1", 4, 1), ("PD", "Subject2", 3, 2)] {
            let base = root.join(group).join(subj);
            fs::create_dir_all(base.join("1.MRI")).unwrap();
            fs::create_dir_all(base.join("0.DaT")).unwrap();
            for i in 1..=mri {
                fs::write(base.join("1.MRI").join(format!("T1_SAG_{:03}.png", i)), b"p").unwrap();
            }
            fs::write(base.join("1.MRI").join("T2_TRA_001.png"), b"p").unwrap();
            for i in 1..=dat {
                fs::write(base.join("0.DaT").join(format!("dat{}.png", i)), b"p").unwrap();
            }
        }

        let groups = discover(&root, "NPD", "PD", &Layout::default(), Some("t1")).expect("discover");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].subjects[0].sequence.len(), 4);
        assert_eq!(groups[1].subjects[0].singles.len(), 2);

        let config = AugmentConfig {
            window: 3,
            ratio: 0.5,
            seed: 3,
        };
        let dataset = augment(&groups, &config).expect("augment");
        // NPD: 2 windows * 1 single, PD: 1 window * 2 singles
        assert_eq!(dataset.split.len(), 4);

        let out = dir.path().join("dataset");
        write_dataset(&dataset, &out).expect("write");
        let train = fs::read_to_string(out.join(TRAIN_FILE)).unwrap();
        let test = fs::read_to_string(out.join(TEST_FILE)).unwrap();
        assert_eq!(train.lines().count() + test.lines().count(), 4);
        assert!(train.lines().all(|l| l.split('\t').count() == 5));

        let summary: DatasetSummary =
            serde_json::from_str(&fs::read_to_string(out.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary.train, 2);
        assert_eq!(summary.groups[1].pairings, 2);
    }

    #[test]
    fn slices_are_ordered_by_instance_number() {
        let dir = tempdir().expect("tmpdir");
        let mri = dir.path().join("PD").join("Subject1").join("1.MRI");
        fs::create_dir_all(&mri).unwrap();
        fs::create_dir_all(dir.path().join("NPD").join("Subject2").join("1.MRI")).unwrap();
        for i in [1000, 101, 999, 2] {
            fs::write(mri.join(format!("T1_SAG_{:03}.png", i)), b"p").unwrap();
        }

        let groups = discover(dir.path(), "NPD", "PD", &Layout::default(), None).expect("discover");
        let names: Vec<_> = groups[1].subjects[0]
            .sequence
            .iter()
            .map(|p| dir_name(p))
            .collect();
        assert_eq!(
            names,
            vec!["T1_SAG_002.png", "T1_SAG_101.png", "T1_SAG_999.png", "T1_SAG_1000.png"]
        );
    }

    #[test]
    fn selection_layout_is_rejected() {
        let dir = tempdir().expect("tmpdir");
        for group in ["NPD", "PD"] {
            let subject = dir.path().join(group).join("MRI").join("Subject1");
            fs::create_dir_all(&subject).unwrap();
            fs::write(subject.join("T1_SAG_001.png"), b"p").unwrap();
        }

        let err = discover(dir.path(), "NPD", "PD", &Layout::default(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::Layout { .. })
        ));
    }

    #[test]
    fn missing_group_directory_is_an_error() {
        let dir = tempdir().expect("tmpdir");
        fs::create_dir_all(dir.path().join("NPD")).unwrap();
        assert!(discover(dir.path(), "NPD", "PD", &Layout::default(), None).is_err());
    }
}
