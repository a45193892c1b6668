use std::path::Path;

use anyhow::{Context, Result};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};

use crate::dicom_access::ElementAccess;
use crate::models::ImageMetadata;

pub fn extract_image_metadata<T: ElementAccess>(obj: &T) -> ImageMetadata {
    ImageMetadata {
        patient_name: obj.element_str(tags::PATIENT_NAME),
        patient_id: obj.element_str(tags::PATIENT_ID),
        study_date: obj.element_str(tags::STUDY_DATE),
        modality: obj.element_str(tags::MODALITY),
        series_description: obj.element_str(tags::SERIES_DESCRIPTION),
        series_number: obj.element_u32(tags::SERIES_NUMBER),
        instance_number: obj.element_u32(tags::INSTANCE_NUMBER),
        rows: obj.element_u32(tags::ROWS),
        columns: obj.element_u32(tags::COLUMNS),
        // Single-frame objects usually omit the attribute altogether.
        number_of_frames: obj.element_u32(tags::NUMBER_OF_FRAMES).unwrap_or(1).max(1),
        photometric_interpretation: obj.element_str(tags::PHOTOMETRIC_INTERPRETATION),
        transfer_syntax: obj.transfer_syntax(),
    }
}

pub fn read_image_metadata(path: &Path) -> Result<ImageMetadata> {
    let obj: DefaultDicomObject = open_file(path).context("Failed to open DICOM file")?;
    Ok(extract_image_metadata(&obj))
}

pub fn print_info(path: &Path, verbose: bool) -> Result<()> {
    let obj: DefaultDicomObject = open_file(path).context("Failed to open DICOM file")?;
    let meta = extract_image_metadata(&obj);
    let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
    let num = |v: Option<u32>| v.map_or_else(|| "N/A".to_string(), |n| n.to_string());

    println!("{}", "=".repeat(80));
    println!("DICOM File Information: {}", path.display());
    println!("{}", "=".repeat(80));

    println!("PATIENT");
    println!("  Name: {}", na(&meta.patient_name));
    println!("  ID:   {}", na(&meta.patient_id));

    println!("\nSTUDY");
    println!("  Date: {}", na(&meta.study_date));

    println!("\nSERIES");
    println!("  Description: {}", na(&meta.series_description));
    println!("  Number:      {}", num(meta.series_number));
    println!("  Instance:    {}", num(meta.instance_number));

    println!("\nIMAGE");
    println!("  Modality: {}", na(&meta.modality));
    println!("  Size:     {} x {}", num(meta.rows), num(meta.columns));
    println!("  Frames:   {}", meta.number_of_frames);
    println!("  Photometric Interpretation: {}", na(&meta.photometric_interpretation));
    println!("  Transfer Syntax: {}", na(&meta.transfer_syntax));

    if verbose {
        println!("\nALL TAGS (Verbose):");
        for element in obj.iter() {
            println!("  {} : {:?}", element.header().tag, element.value());
        }
    }

    Ok(())
}
