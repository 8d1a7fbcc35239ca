//! The CV document as an opaque JSON unit.
//!
//! Nothing outside this module looks inside the document beyond the
//! structural check in [`is_valid_document`] and top-level section lookup.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::error::DomainError;

/// Kind of JSON value a known top-level section must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Object,
    Text,
    List,
}

/// Every section the API serves under `/api/v1/cv/sections/{name}`.
pub const SECTIONS: [(&str, SectionKind); 8] = [
    ("personalInfo", SectionKind::Object),
    ("summary", SectionKind::Text),
    ("experience", SectionKind::List),
    ("education", SectionKind::List),
    ("skills", SectionKind::List),
    ("projects", SectionKind::List),
    ("certifications", SectionKind::List),
    ("languages", SectionKind::List),
];

pub fn section_names() -> impl Iterator<Item = &'static str> {
    SECTIONS.iter().map(|(name, _)| *name)
}

pub fn is_known_section(name: &str) -> bool {
    SECTIONS.iter().any(|(known, _)| *known == name)
}

/// Structural shape check applied to every document regardless of its source.
pub fn is_valid_document(value: &Value) -> bool {
    validate_shape(value).is_ok()
}

fn validate_shape(value: &Value) -> Result<(), DomainError> {
    let object = value
        .as_object()
        .ok_or_else(|| DomainError::validation("document must be a JSON object"))?;

    let personal = object
        .get("personalInfo")
        .and_then(Value::as_object)
        .ok_or_else(|| DomainError::validation("`personalInfo` must be an object"))?;

    let has_name = personal
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.trim().is_empty());
    if !has_name {
        return Err(DomainError::validation(
            "`personalInfo.name` must be a non-empty string",
        ));
    }

    for (name, kind) in SECTIONS {
        let Some(section) = object.get(name) else {
            continue;
        };
        let matches = match kind {
            SectionKind::Object => section.is_object(),
            SectionKind::Text => section.is_string(),
            SectionKind::List => section.is_array(),
        };
        if !matches {
            return Err(DomainError::validation(format!(
                "section `{name}` has the wrong type"
            )));
        }
    }

    Ok(())
}

/// A structurally valid CV document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct CvDocument(Map<String, Value>);

impl CvDocument {
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        validate_shape(&value)?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(DomainError::invariant("validated document is not an object")),
        }
    }

    pub fn section(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Hex SHA-256 of the compact JSON form; stable for identical content.
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        // Map<String, Value> serialization is infallible.
        let bytes = serde_json::to_vec(&self.0).unwrap_or_default();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

impl TryFrom<Value> for CvDocument {
    type Error = DomainError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<CvDocument> for Value {
    fn from(document: CvDocument) -> Self {
        Value::Object(document.0)
    }
}
