use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject};

/// Small helper trait to pull values out of file objects and DICOMDIR record items alike.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn has_element(&self, tag: Tag) -> bool;
    fn transfer_syntax(&self) -> Option<String>;

    /// Integer-valued attributes (IS/US/UL); DICOM text padding is tolerated.
    fn element_u32(&self, tag: Tag) -> Option<u32> {
        self.element_str(tag).and_then(|s| s.trim().parse().ok())
    }
}

fn trimmed(raw: std::borrow::Cow<'_, str>) -> Option<String> {
    let value = raw.trim_end_matches(['\0', ' ']).trim_start();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .and_then(trimmed)
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }

    fn transfer_syntax(&self) -> Option<String> {
        Some(
            self.meta()
                .transfer_syntax()
                .trim_end_matches('\0')
                .to_string(),
        )
    }
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .and_then(trimmed)
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }

    fn transfer_syntax(&self) -> Option<String> {
        None
    }
}
