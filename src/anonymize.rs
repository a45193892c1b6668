use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, InMemDicomObject};
use tracing::{debug, info, warn};

use crate::alias::{AliasStore, Pseudonymizer};
use crate::dicom_access::ElementAccess;
use crate::error::PrepError;

/// Swap the patient-identifying fields for the alias; every other attribute is kept verbatim.
/// Returns the alias, or `None` when the object carries no patient identifier at all.
pub fn anonymize_object(
    obj: &mut InMemDicomObject,
    pseudonymizer: &mut dyn Pseudonymizer,
) -> Result<Option<String>> {
    let real = obj
        .element_str(tags::PATIENT_NAME)
        .or_else(|| obj.element_str(tags::PATIENT_ID));
    let Some(real) = real else {
        return Ok(None);
    };

    let alias = pseudonymizer.pseudonym(&real)?;
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(alias.as_str()),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(alias.as_str()),
    ));
    obj.remove_element(tags::PATIENT_BIRTH_DATE);
    Ok(Some(alias))
}

/// Anonymize one file, defaulting the output to `<stem>_anon.dcm` beside the input.
pub fn anonymize_file(
    input: &Path,
    output: Option<PathBuf>,
    store: &mut AliasStore,
) -> Result<PathBuf> {
    let mut obj = open_file(input).context("Failed to open DICOM file")?;

    let alias = anonymize_object(&mut obj, store)?;
    if alias.is_none() {
        warn!("{:?} carries no patient name or ID, nothing to replace", input);
    }

    let output_path = match output {
        Some(p) => p,
        None => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| PrepError::InvalidPath(input.to_path_buf()))?;
            input.with_file_name(format!("{}_anon.dcm", stem))
        }
    };

    obj.write_to_file(&output_path)
        .with_context(|| format!("Failed to write {:?}", output_path))?;
    info!("Anonymized file saved to {:?}", output_path);
    Ok(output_path)
}

/// Rename every patient directory directly under `parent` to its alias.
/// Directory names are the real identifiers. Returns `(real name, alias)` per renamed directory.
pub fn anonymize_directories(
    parent: &Path,
    store: &mut AliasStore,
) -> Result<Vec<(String, String)>> {
    if !parent.is_dir() {
        return Err(PrepError::InvalidPath(parent.to_path_buf()).into());
    }

    let mut names: Vec<String> = fs::read_dir(parent)
        .with_context(|| format!("Failed to list {:?}", parent))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();

    let mut renamed = Vec::new();
    for name in names {
        if store.is_alias(&name) {
            debug!("{} is already anonymized", name);
            continue;
        }
        let alias = store.resolve(&name);
        let target = parent.join(&alias);
        if target.exists() {
            warn!("Cannot rename {:?}: {:?} already exists", name, target);
            continue;
        }
        fs::rename(parent.join(&name), &target)
            .with_context(|| format!("Failed to rename {:?} to {:?}", name, alias))?;
        debug!("Renamed {} to {}", name, alias);
        renamed.push((name, alias));
    }
    info!("{} patient directories anonymized under {:?}", renamed.len(), parent);
    Ok(renamed)
}
