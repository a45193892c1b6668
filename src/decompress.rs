//
// decompress.rs
// Dicom-Prep-rs
//
// Turns compressed DICOM pixel data into a native transfer syntax, through gdcmconv or the in-process decoder.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{open_file, FileDicomObject, FileMetaTableBuilder, OpenFileOptions};
use dicom::pixeldata::PixelDecoder;
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use tracing::{debug, info, warn};

use crate::error::PrepError;
use crate::models::DecompressReport;
use crate::scan;

pub const DEFAULT_TOOL: &str = "gdcmconv";
pub const DEFAULT_MODIFIER: &str = "_decomp";

/// Transfer syntaxes whose pixel data any reader can take as-is.
const NATIVE_TRANSFER_SYNTAXES: [&str; 4] = [
    "1.2.840.10008.1.2",      // Implicit VR Little Endian
    "1.2.840.10008.1.2.1",    // Explicit VR Little Endian
    "1.2.840.10008.1.2.2",    // Explicit VR Big Endian
    "1.2.840.10008.1.2.1.99", // Deflated Explicit VR Little Endian
];

pub fn is_compressed(transfer_syntax_uid: &str) -> bool {
    let uid = transfer_syntax_uid.trim_end_matches(['\0', ' ']);
    !NATIVE_TRANSFER_SYNTAXES.contains(&uid)
}

/// Read the file meta only and report the transfer syntax UID.
pub fn transfer_syntax_of(path: &Path) -> Result<String> {
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Failed to open DICOM file {:?}", path))?;
    Ok(obj.meta().transfer_syntax().trim_end_matches('\0').to_string())
}

/// `a/b.dcm` -> `a/b_decomp.dcm`; files without an extension gain `.dcm`.
pub fn decompressed_name(path: &Path, modifier: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dcm".to_string());
    path.with_file_name(format!("{}{}.{}", stem, modifier, ext))
}

#[derive(Debug, Clone)]
enum Backend {
    External(String),
    Native,
}

#[derive(Debug, Clone)]
pub struct Decompressor {
    backend: Backend,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL)
    }
}

impl Decompressor {
    /// Delegate to an external `gdcmconv`-compatible tool.
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            backend: Backend::External(tool.into()),
        }
    }

    /// Decode in process with whatever codecs dicom-pixeldata was built with.
    pub fn native() -> Self {
        Self {
            backend: Backend::Native,
        }
    }

    pub fn tool(&self) -> Option<&str> {
        match &self.backend {
            Backend::External(tool) => Some(tool),
            Backend::Native => None,
        }
    }

    /// Whether the backend can run at all. The external tool only needs to be spawnable.
    pub fn is_available(&self) -> bool {
        match &self.backend {
            Backend::External(tool) => Command::new(tool)
                .arg("-v")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok(),
            Backend::Native => true,
        }
    }

    /// Decompress `input` into `output`. `input == output` is allowed.
    pub fn decompress_file(&self, input: &Path, output: &Path) -> Result<()> {
        match &self.backend {
            Backend::External(tool) => run_tool(tool, input, output),
            Backend::Native => decode_in_process(input, output),
        }
    }

    /// Decompress every compressed DICOM image under `root`, in place or beside the original.
    pub fn decompress_tree(
        &self,
        root: &Path,
        replace: bool,
        modifier: &str,
    ) -> Result<DecompressReport> {
        if !root.exists() {
            return Err(PrepError::InvalidPath(root.to_path_buf()).into());
        }
        let mut report = DecompressReport::default();

        for path in scan::find_dicom(root) {
            report.examined += 1;
            let ts = match transfer_syntax_of(&path) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!("Cannot read {:?}: {:#}", path, e);
                    report.failed += 1;
                    continue;
                }
            };
            if !is_compressed(&ts) {
                debug!("{:?} already uses {}", path, ts);
                report.already_native += 1;
                continue;
            }

            let target = decompressed_name(&path, modifier);
            let result = self.decompress_file(&path, &target).and_then(|_| {
                if replace {
                    fs::rename(&target, &path)
                        .with_context(|| format!("Failed to replace {:?}", path))?;
                }
                Ok(())
            });

            match result {
                Ok(()) => {
                    report.decompressed += 1;
                    info!(
                        "Decompressed image {} ({:?})",
                        report.decompressed,
                        if replace { &path } else { &target }
                    );
                }
                Err(e) => {
                    // A missing tool fails every remaining file the same way.
                    if matches!(e.downcast_ref::<PrepError>(), Some(PrepError::ToolMissing { .. })) {
                        return Err(e);
                    }
                    warn!("Cannot decompress {:?}: {:#}", path, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

fn run_tool(tool: &str, input: &Path, output: &Path) -> Result<()> {
    debug!("{} --raw {:?} {:?}", tool, input, output);
    let result = Command::new(tool)
        .arg("--raw")
        .arg(input)
        .arg(output)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let out = match result {
        Ok(out) => out,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PrepError::ToolMissing {
                tool: tool.to_string(),
            }
            .into())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to run {}", tool)),
    };

    if !out.status.success() || !output.exists() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", tool, stderr.trim());
        }
        return Err(PrepError::ToolFailed {
            tool: tool.to_string(),
            path: input.to_path_buf(),
            status: out.status.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Decode the pixel data with dicom-pixeldata and store the samples uncompressed as
/// Explicit VR Little Endian. Stored values are kept as they are: no LUT is applied.
fn decode_in_process(input: &Path, output: &Path) -> Result<()> {
    let obj = open_file(input).with_context(|| format!("Failed to open DICOM file {:?}", input))?;
    let decode_error = |reason: String| PrepError::Decode {
        path: input.to_path_buf(),
        reason,
    };

    let (mut samples, bits_allocated) = {
        let decoded = obj
            .decode_pixel_data()
            .map_err(|e| decode_error(e.to_string()))?;
        (decoded.data().to_vec(), decoded.bits_allocated())
    };
    // OB/OW values must have an even length.
    if samples.len() % 2 == 1 {
        samples.push(0);
    }
    let vr = if bits_allocated > 8 { VR::OW } else { VR::OB };

    let sop_class = obj.meta().media_storage_sop_class_uid.trim_end_matches('\0').to_string();
    let sop_instance = obj
        .meta()
        .media_storage_sop_instance_uid
        .trim_end_matches('\0')
        .to_string();
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .build()
        .map_err(|e| decode_error(e.to_string()))?;

    let mut native = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj.into_inner() {
        native.put(elem);
    }
    native.put(DataElement::new(
        tags::PIXEL_DATA,
        vr,
        PrimitiveValue::from(samples),
    ));

    native
        .write_to_file(output)
        .with_context(|| format!("Failed to write {:?}", output))?;
    debug!("Decoded {:?} in process into {:?}", input, output);
    Ok(())
}
