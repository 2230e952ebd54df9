use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stamp {
    pub id: u32,
    pub display_name: String,
    pub image_ref: String,
    pub detection_tag: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog has no stamps")]
    Empty,
    #[error("stamp ids must be positive")]
    ZeroId,
    #[error("duplicate stamp id {0}")]
    DuplicateId(u32),
    #[error("stamp {0} has an empty detection tag")]
    EmptyTag(u32),
    #[error("detection tag {0:?} is used by more than one stamp")]
    DuplicateTag(String),
    #[error("failed to read catalog: {0}")]
    Io(String),
    #[error("failed to parse catalog: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    stamps: Vec<Stamp>,
}

impl Catalog {
    pub fn new(mut stamps: Vec<Stamp>) -> Result<Self, CatalogError> {
        if stamps.is_empty() {
            return Err(CatalogError::Empty);
        }
        for stamp in &mut stamps {
            let trimmed = stamp.detection_tag.trim();
            if trimmed.len() != stamp.detection_tag.len() {
                stamp.detection_tag = trimmed.to_string();
            }
        }

        let mut ids = HashSet::new();
        let mut tags = HashSet::new();
        for stamp in &stamps {
            if stamp.id == 0 {
                return Err(CatalogError::ZeroId);
            }
            if !ids.insert(stamp.id) {
                return Err(CatalogError::DuplicateId(stamp.id));
            }
            if stamp.detection_tag.is_empty() {
                return Err(CatalogError::EmptyTag(stamp.id));
            }
            if !tags.insert(stamp.detection_tag.as_str()) {
                return Err(CatalogError::DuplicateTag(stamp.detection_tag.clone()));
            }
        }

        Ok(Self { stamps })
    }

    pub fn from_json(contents: &str) -> Result<Self, CatalogError> {
        let stamps = serde_json::from_str::<Vec<Stamp>>(contents)
            .map_err(|error| CatalogError::Parse(error.to_string()))?;
        Self::new(stamps)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents =
            fs::read_to_string(path).map_err(|error| CatalogError::Io(error.to_string()))?;
        Self::from_json(&contents)
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    pub fn by_tag(&self, detection_tag: &str) -> Option<&Stamp> {
        self.stamps
            .iter()
            .find(|stamp| stamp.detection_tag == detection_tag)
    }

    pub fn by_id(&self, id: u32) -> Option<&Stamp> {
        self.stamps.iter().find(|stamp| stamp.id == id)
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.by_id(id).is_some()
    }
}

#[cfg(test)]
pub(crate) fn sample_catalog() -> Catalog {
    let stamps = ["a", "b", "c", "d"]
        .iter()
        .enumerate()
        .map(|(index, tag)| Stamp {
            id: index as u32 + 1,
            display_name: format!("Stamp {}", tag.to_uppercase()),
            image_ref: format!("stamps/{tag}.png"),
            detection_tag: tag.to_string(),
        })
        .collect();
    Catalog::new(stamps).expect("sample catalog should be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(id: u32, tag: &str) -> Stamp {
        Stamp {
            id,
            display_name: format!("Stamp {id}"),
            image_ref: format!("stamps/{id}.png"),
            detection_tag: tag.to_string(),
        }
    }

    #[test]
    fn looks_up_stamps_by_tag_and_id() {
        let catalog = sample_catalog();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.by_tag("c").map(|stamp| stamp.id), Some(3));
        assert_eq!(
            catalog.by_id(2).map(|stamp| stamp.detection_tag.as_str()),
            Some("b")
        );
        assert!(catalog.by_tag("x").is_none());
        assert!(!catalog.contains_id(9));
    }

    #[test]
    fn rejects_invalid_catalogs() {
        assert_eq!(Catalog::new(Vec::new()), Err(CatalogError::Empty));
        assert_eq!(Catalog::new(vec![stamp(0, "a")]), Err(CatalogError::ZeroId));
        assert_eq!(
            Catalog::new(vec![stamp(1, "a"), stamp(1, "b")]),
            Err(CatalogError::DuplicateId(1))
        );
        assert_eq!(
            Catalog::new(vec![stamp(1, "a"), stamp(2, "a")]),
            Err(CatalogError::DuplicateTag("a".to_string()))
        );
        assert_eq!(
            Catalog::new(vec![stamp(1, "  ")]),
            Err(CatalogError::EmptyTag(1))
        );
    }

    #[test]
    fn detection_tags_are_trimmed_on_construction() {
        let catalog = Catalog::new(vec![stamp(1, " a "), stamp(2, "b\n")])
            .expect("padded tags should be accepted");
        assert_eq!(catalog.by_tag("a").map(|stamp| stamp.id), Some(1));
        assert_eq!(catalog.by_tag("b").map(|stamp| stamp.id), Some(2));
        assert_eq!(
            Catalog::new(vec![stamp(1, "a"), stamp(2, " a")]),
            Err(CatalogError::DuplicateTag("a".to_string()))
        );
    }

    #[test]
    fn parses_catalog_json() {
        let json = r#"[
  { "id": 10, "display_name": "Gate", "image_ref": "gate.png", "detection_tag": "gate" },
  { "id": 11, "display_name": "Tower", "image_ref": "tower.png", "detection_tag": "tower" }
]"#;
        let catalog = Catalog::from_json(json).expect("catalog should parse");
        assert_eq!(catalog.by_tag("tower").map(|stamp| stamp.id), Some(11));
        assert!(matches!(
            Catalog::from_json("{"),
            Err(CatalogError::Parse(_))
        ));
    }
}
