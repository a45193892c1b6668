//
// convert.rs
// Dicom-Prep-rs
//
// Renders DICOM images to PNG under metadata-derived names, with anonymized metadata and DICOMDIR conversion logs.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use dicom::pixeldata::PixelDecoder;
use dicom_pixeldata::{ConvertOptions, VoiLutOption};
use image::ImageFormat;
use tracing::{debug, error, info, warn};

use crate::alias::Pseudonymizer;
use crate::decompress::{self, Decompressor};
use crate::dicom_access::ElementAccess;
use crate::error::PrepError;
use crate::metadata::extract_image_metadata;
use crate::models::{ConversionReport, ImageMetadata};
use crate::scan::{self, DICOMDIR};

pub const CONVERSION_LOG: &str = "conversion_log.txt";
pub const COMPRESSED_LOG: &str = "compressed images.txt";

/// Options controlling where and how PNG renderings are written.
#[derive(Debug, Clone, Default)]
pub struct PngExportOptions {
    /// Keep the source file stem instead of `<SeriesDescription>_<InstanceNumber>`.
    pub same_name: bool,
    /// Delete each DICOM file once it has been converted.
    pub cleanup: bool,
    /// Where conversion logs go. `None` disables them.
    pub log_dir: Option<PathBuf>,
}

/// One converted DICOM file: PNG bytes per frame plus its (anonymized) metadata.
#[derive(Debug, Clone)]
pub struct ConvertedImage {
    pub frames: Vec<Vec<u8>>,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct Converter {
    options: PngExportOptions,
    decompressor: Decompressor,
}

impl Converter {
    pub fn new(options: PngExportOptions, decompressor: Decompressor) -> Self {
        Self {
            options,
            decompressor,
        }
    }

    pub fn options(&self) -> &PngExportOptions {
        &self.options
    }

    /// Decode `path` into PNG frames, decompressing first when the stored syntax cannot be decoded.
    pub fn convert_file(
        &self,
        path: &Path,
        pseudonymizer: &mut dyn Pseudonymizer,
    ) -> Result<ConvertedImage> {
        let obj = open_file(path).with_context(|| format!("Failed to open DICOM file {:?}", path))?;
        let mut metadata = extract_image_metadata(&obj);
        anonymize_metadata(&mut metadata, pseudonymizer)?;

        let frames = match render_frames(&obj) {
            Ok(frames) => frames,
            Err(err) => {
                let ts = metadata.transfer_syntax.as_deref().unwrap_or_default();
                if !decompress::is_compressed(ts) {
                    return Err(err);
                }
                debug!("{:?} uses compressed syntax {}, decompressing first", path, ts);
                self.render_decompressed(path)?
            }
        };

        Ok(ConvertedImage { frames, metadata })
    }

    fn render_decompressed(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
        let tmp = decompress::decompressed_name(path, decompress::DEFAULT_MODIFIER);
        self.decompressor.decompress_file(path, &tmp)?;
        let frames = open_file(&tmp)
            .context("Failed to open decompressed file")
            .and_then(|obj| render_frames(&obj));
        if let Err(e) = fs::remove_file(&tmp) {
            warn!("Could not remove temporary file {:?}: {}", tmp, e);
        }
        frames
    }

    /// Write the frames of `image` into `out_dir`, never overwriting an existing PNG.
    pub fn write_pngs(
        &self,
        source: &Path,
        image: &ConvertedImage,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let base = if self.options.same_name {
            source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| PrepError::InvalidPath(source.to_path_buf()))?
        } else {
            let desc = image.metadata.series_description.as_deref().ok_or_else(|| {
                PrepError::MissingAttribute {
                    path: source.to_path_buf(),
                    attribute: "SeriesDescription",
                }
            })?;
            sanitize_description(desc)
        };

        let names: Vec<String> = if image.frames.len() > 1 {
            (1..=image.frames.len())
                .map(|i| format!("{}_{:03}", base, i))
                .collect()
        } else if self.options.same_name {
            vec![base]
        } else {
            let instance = image
                .metadata
                .instance_number
                .ok_or_else(|| PrepError::MissingAttribute {
                    path: source.to_path_buf(),
                    attribute: "InstanceNumber",
                })?;
            vec![format!("{}_{:03}", base, instance)]
        };

        let mut written = Vec::with_capacity(names.len());
        for (name, bytes) in names.iter().zip(&image.frames) {
            let target = unique_png_path(out_dir, name);
            fs::write(&target, bytes)
                .with_context(|| format!("Failed to save image to {:?}", target))?;
            written.push(target);
        }
        Ok(written)
    }

    /// Convert every DICOM image of one patient directory. `out_dir` defaults to `root`.
    pub fn convert_patient(
        &self,
        root: &Path,
        pseudonymizer: &mut dyn Pseudonymizer,
        out_dir: Option<&Path>,
    ) -> Result<ConversionReport> {
        let out_dir = out_dir.unwrap_or(root);
        info!("Attempting to convert patient {:?}", root);
        let dicom_files = scan::find_dicom(root);
        if dicom_files.is_empty() {
            return Err(PrepError::Layout {
                path: root.to_path_buf(),
                reason: "path does not contain any DICOM files".to_string(),
            }
            .into());
        }

        let dicomdir = root.join(DICOMDIR);
        if dicomdir.is_file() {
            if let Some(log_dir) = &self.options.log_dir {
                match conversion_log(&dicomdir, pseudonymizer) {
                    Ok(log) => append_log(&log_dir.join(CONVERSION_LOG), &log)?,
                    Err(e) => warn!("Could not build a conversion log from {:?}: {:#}", dicomdir, e),
                }
            }
        }

        fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {:?}", out_dir))?;
        let mut report = ConversionReport::default();
        for path in &dicom_files {
            let outcome = self
                .convert_file(path, pseudonymizer)
                .and_then(|image| self.write_pngs(path, &image, out_dir));
            match outcome {
                Ok(written) => {
                    report.successful += 1;
                    report.extra_frames += written.len().saturating_sub(1);
                    if written.len() > 1 {
                        debug!("Image sequence has {} frames.", written.len());
                    }
                    if self.options.cleanup {
                        match fs::remove_file(path) {
                            Ok(()) => report.removed += 1,
                            Err(e) => warn!("Could not delete {:?}: {}", path, e),
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to convert {:?}: {:#}", path, e);
                    report.failed += 1;
                    report.failures.push(path.clone());
                    let compressed = decompress::transfer_syntax_of(path)
                        .map(|ts| decompress::is_compressed(&ts))
                        .unwrap_or(false);
                    if compressed {
                        report.compressed.push(path.clone());
                    }
                }
            }
        }

        info!(
            "Successfully converted {} of {} total images.",
            report.successful,
            dicom_files.len()
        );
        Ok(report)
    }

    /// Convert every patient under `root`: one per DICOMDIR, or `root` itself when there is none.
    pub fn convert_tree(
        &self,
        root: &Path,
        pseudonymizer: &mut dyn Pseudonymizer,
    ) -> Result<ConversionReport> {
        if !root.exists() {
            return Err(PrepError::InvalidPath(root.to_path_buf()).into());
        }
        // A path to a DICOMDIR file means "the patient it indexes".
        let root = if root.file_name().map_or(false, |n| n == DICOMDIR) {
            root.parent().unwrap_or(root)
        } else {
            root
        };

        let mut patients = scan::find_dicomdirs(root);
        if patients.is_empty() {
            patients.push(root.to_path_buf());
        }

        let mut report = ConversionReport::default();
        for patient in &patients {
            match self.convert_patient(patient, pseudonymizer, None) {
                Ok(r) => report.merge(r),
                Err(e) => error!("Skipping patient {:?}: {:#}", patient, e),
            }
        }

        if !report.compressed.is_empty() {
            if let Some(log_dir) = &self.options.log_dir {
                write_compressed_list(log_dir, &report.compressed)?;
            }
        }
        Ok(report)
    }
}

/// Replace the identifying fields by the alias of the patient they belong to.
pub fn anonymize_metadata(
    metadata: &mut ImageMetadata,
    pseudonymizer: &mut dyn Pseudonymizer,
) -> Result<()> {
    let real = metadata
        .patient_name
        .clone()
        .or_else(|| metadata.patient_id.clone());
    if let Some(real) = real {
        let alias = pseudonymizer.pseudonym(&real)?;
        metadata.patient_name = Some(alias.clone());
        metadata.patient_id = Some(alias);
    }
    Ok(())
}

/// `T2 TIRM tra/dark-fl` -> `T2_TIRM_tra_dark-fl`.
pub fn sanitize_description(desc: &str) -> String {
    desc.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace(['/', ':'], "_")
}

fn unique_png_path(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}.png", name));
    let mut copy = 0;
    while candidate.exists() {
        copy += 1;
        candidate = dir.join(format!("{}_copy{}.png", name, copy));
    }
    if copy > 0 {
        debug!("Image {}.png already exists, saving as {:?}", name, candidate);
    }
    candidate
}

fn render_frames(obj: &DefaultDicomObject) -> Result<Vec<Vec<u8>>> {
    let decoded = obj
        .decode_pixel_data()
        .context("Failed to decode pixel data")?;

    // Linear min/max normalization into 8 bits, the same look as a plain viewer.
    let options = ConvertOptions::new()
        .with_voi_lut(VoiLutOption::Normalize)
        .force_8bit();

    let mut frames = Vec::new();
    for frame in 0..decoded.number_of_frames() {
        let image = decoded
            .to_dynamic_image_with_options(frame, &options)
            .with_context(|| format!("Failed to render frame {}", frame))?;
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .context("Failed to encode PNG")?;
        frames.push(buffer);
    }
    Ok(frames)
}

/// The header carries no path: patient directories are still named after real identifiers here.
fn append_log(log_path: &Path, log: &str) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut entry = String::new();
    let _ = writeln!(
        entry,
        "\n# converted {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    entry.push_str(log);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open {:?}", log_path))?;
    file.write_all(entry.as_bytes())
        .with_context(|| format!("Failed to write {:?}", log_path))?;
    info!("Log file updated: {:?}", log_path);
    Ok(())
}

pub fn write_compressed_list(log_dir: &Path, files: &[PathBuf]) -> Result<()> {
    fs::create_dir_all(log_dir).with_context(|| format!("Failed to create {:?}", log_dir))?;
    let mut out = String::from("DICOM images that failed due to compression:\n");
    for f in files {
        let _ = writeln!(out, "{}", f.display());
    }
    let path = log_dir.join(COMPRESSED_LOG);
    fs::write(&path, out).with_context(|| format!("Failed to write {:?}", path))?;
    warn!("{} compressed image(s) listed in {:?}", files.len(), path);
    Ok(())
}

/// Patient, study and series sections from a DICOMDIR. Patient name and ID are replaced by the alias.
pub fn conversion_log(dicomdir: &Path, pseudonymizer: &mut dyn Pseudonymizer) -> Result<String> {
    let obj = open_file(dicomdir).with_context(|| format!("Failed to open {:?}", dicomdir))?;
    let records = obj
        .element(tags::DIRECTORY_RECORD_SEQUENCE)
        .ok()
        .and_then(|e| e.items())
        .ok_or_else(|| PrepError::MissingAttribute {
            path: dicomdir.to_path_buf(),
            attribute: "DirectoryRecordSequence",
        })?;

    let dots = "-".repeat(9);
    let banner = dots.repeat(4);
    let space = " ".repeat(20);
    let mut patient = String::new();
    let mut study = String::new();
    let mut series = Vec::new();
    let mut images_in_series = 0usize;

    for item in records {
        let kind = item.element_str(tags::DIRECTORY_RECORD_TYPE).unwrap_or_default();
        match kind.as_str() {
            "PATIENT" => {
                let real = item
                    .element_str(tags::PATIENT_NAME)
                    .or_else(|| item.element_str(tags::PATIENT_ID));
                let alias = match real {
                    Some(real) => Some(pseudonymizer.pseudonym(&real)?),
                    None => None,
                };
                let _ = writeln!(patient, "{} PATIENT INFO {}", banner, banner);
                field(&mut patient, "", "Patient's Name", alias.clone());
                field(&mut patient, "", "Patient ID", alias);
                field(&mut patient, "", "Patient's Sex", item.element_str(tags::PATIENT_SEX));
            }
            "STUDY" => {
                let _ = writeln!(study, "{} STUDY INFO {}", banner, banner);
                field(&mut study, "", "Study Date", item.element_str(tags::STUDY_DATE));
                field(&mut study, "", "Study Time", item.element_str(tags::STUDY_TIME));
                field(&mut study, "", "Study ID", item.element_str(tags::STUDY_ID));
                field(
                    &mut study,
                    "",
                    "Study Description",
                    item.element_str(tags::STUDY_DESCRIPTION),
                );
            }
            "SERIES" => {
                close_series(&mut series, &space, images_in_series);
                images_in_series = 0;
                let mut s = String::new();
                let _ = writeln!(s, "{} SERIES INFO {}", banner, banner);
                let _ = writeln!(
                    s,
                    "{}{} SERIES {} {}",
                    space,
                    dots.repeat(2),
                    series.len() + 1,
                    dots.repeat(2)
                );
                field(&mut s, &space, "Modality", item.element_str(tags::MODALITY));
                field(&mut s, &space, "Series Number", item.element_str(tags::SERIES_NUMBER));
                field(
                    &mut s,
                    &space,
                    "Series Description",
                    item.element_str(tags::SERIES_DESCRIPTION),
                );
                series.push(s);
            }
            "IMAGE" => images_in_series += 1,
            _ => {}
        }
    }
    close_series(&mut series, &space, images_in_series);

    let mut out = String::new();
    out.push_str(&patient);
    out.push_str(&study);
    for s in series {
        out.push_str(&s);
    }
    Ok(out)
}

fn field(out: &mut String, indent: &str, label: &str, value: Option<String>) {
    if let Some(value) = value {
        let _ = writeln!(out, "{}{:<30}{}", indent, label, value);
    }
}

fn close_series(series: &mut [String], indent: &str, images: usize) {
    if let Some(last) = series.last_mut() {
        let _ = writeln!(last, "{}{:<30}{}", indent, "Images", images);
    }
}

pub fn print_report(report: &ConversionReport, cleanup: bool) {
    println!("\n------------------- Report -------------------");
    println!("{:<40} {}", "DICOM-to-png conversions attempted:", report.attempted());
    println!("{:<40} {}", "DICOM-to-png conversions successful:", report.successful);
    println!("{:<40} {}", "DICOM-to-png conversions failed:", report.failed);
    println!("{:<40} {}", "Total number of .png images created:", report.png_created());
    if !report.compressed.is_empty() {
        println!("{:<40} {}", "Failed due to compression:", report.compressed.len());
    }
    if cleanup {
        println!("{:<40} {}", "Deleted DICOM images:", report.removed);
    }
    println!();
}
