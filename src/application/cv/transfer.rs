//! JSON and YAML export and import of the CV document.

use serde_json::Value;
use thiserror::Error;
use vitae_api_types::ExportFormat;

use crate::domain::CvDocument;
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to serialize document as json: {0}")]
    EncodeJson(#[source] serde_json::Error),
    #[error("failed to serialize document as yaml: {0}")]
    EncodeYaml(#[source] serde_yaml::Error),
    #[error("body is not valid {format}: {message}")]
    Parse {
        format: ExportFormat,
        message: String,
    },
    #[error("body is neither valid json nor valid yaml")]
    Unrecognized,
    #[error(transparent)]
    Invalid(#[from] DomainError),
}

pub fn export(document: &CvDocument, format: ExportFormat) -> Result<String, TransferError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(document.as_map()).map_err(TransferError::EncodeJson)
        }
        ExportFormat::Yaml => {
            serde_yaml::to_string(document.as_map()).map_err(TransferError::EncodeYaml)
        }
    }
}

/// Import format named by a `Content-Type`, if it names one.
pub fn format_from_content_type(content_type: &str) -> Option<ExportFormat> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/json" | "text/json" => Some(ExportFormat::Json),
        "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" => {
            Some(ExportFormat::Yaml)
        }
        _ => None,
    }
}

/// Parse an import body. Without a declared format JSON is tried before YAML.
pub fn parse_import(body: &[u8], format: Option<ExportFormat>) -> Result<CvDocument, TransferError> {
    let value = match format {
        Some(format) => parse_as(body, format)?,
        None => parse_as(body, ExportFormat::Json)
            .or_else(|_| parse_as(body, ExportFormat::Yaml))
            .map_err(|_| TransferError::Unrecognized)?,
    };
    Ok(CvDocument::from_value(value)?)
}

fn parse_as(body: &[u8], format: ExportFormat) -> Result<Value, TransferError> {
    let parsed = match format {
        ExportFormat::Json => serde_json::from_slice(body).map_err(|err| err.to_string()),
        ExportFormat::Yaml => serde_yaml::from_slice(body).map_err(|err| err.to_string()),
    };
    parsed.map_err(|message| TransferError::Parse { format, message })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document() -> CvDocument {
        CvDocument::from_value(json!({
            "personalInfo": {"name": "Ada Lovelace"},
            "skills": ["analysis", "notes"]
        }))
        .unwrap()
    }

    #[test]
    fn yaml_export_imports_back() {
        let text = export(&document(), ExportFormat::Yaml).unwrap();
        assert!(text.contains("name: Ada Lovelace"));
        let imported = parse_import(text.as_bytes(), Some(ExportFormat::Yaml)).unwrap();
        assert_eq!(imported, document());
    }

    #[test]
    fn undeclared_bodies_are_sniffed() {
        let json_body = br#"{"personalInfo": {"name": "A"}}"#;
        assert!(parse_import(json_body, None).is_ok());

        let yaml_body = b"personalInfo:\n  name: A\nsummary: hello\n";
        let imported = parse_import(yaml_body, None).unwrap();
        assert_eq!(imported.section("summary"), Some(&json!("hello")));

        assert!(matches!(
            parse_import(b"personalInfo: [unclosed", None),
            Err(TransferError::Unrecognized)
        ));
    }

    #[test]
    fn declared_format_is_enforced() {
        let yaml_body = b"personalInfo:\n  name: A\n";
        assert!(matches!(
            parse_import(yaml_body, Some(ExportFormat::Json)),
            Err(TransferError::Parse {
                format: ExportFormat::Json,
                ..
            })
        ));
    }

    #[test]
    fn structurally_invalid_imports_are_rejected() {
        let err = parse_import(br#"{"summary": "x"}"#, Some(ExportFormat::Json)).unwrap_err();
        assert!(matches!(err, TransferError::Invalid(_)));
    }

    #[test]
    fn content_types_map_to_formats() {
        assert_eq!(
            format_from_content_type("application/json; charset=utf-8"),
            Some(ExportFormat::Json)
        );
        assert_eq!(
            format_from_content_type("Application/X-YAML"),
            Some(ExportFormat::Yaml)
        );
        assert_eq!(format_from_content_type("text/plain"), None);
    }
}
