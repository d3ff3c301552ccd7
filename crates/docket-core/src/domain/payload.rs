//! Kind-specific payloads and their validation.
//!
//! The CRUD layer hands over raw JSON; `TaskPayload::decode` turns it into a
//! typed payload for the given kind. Template-bound kinds must name their
//! template explicitly at creation time.

use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::task_kind::TaskKind;

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "odt", "txt", "md"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentParse {
    pub document_id: String,
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentReview {
    pub document_id: String,
    pub template_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentGenerate {
    pub template_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateReview {
    pub template_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum TaskPayload {
    DocumentParse(DocumentParse),
    DocumentReview(DocumentReview),
    DocumentGenerate(DocumentGenerate),
    TemplateReview(TemplateReview),
}

/// Limits applied at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    pub max_content_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_content_bytes: 2 * 1024 * 1024,
        }
    }
}

impl TaskPayload {
    /// Decode the raw JSON the caller supplied for `kind`.
    pub fn decode(kind: TaskKind, raw: serde_json::Value) -> Result<Self, ValidationError> {
        let malformed = |e: serde_json::Error| ValidationError::Malformed {
            kind: kind.to_string(),
            reason: e.to_string(),
        };
        let payload = match kind {
            TaskKind::DocumentParse => {
                TaskPayload::DocumentParse(serde_json::from_value(raw).map_err(malformed)?)
            }
            TaskKind::DocumentReview => {
                TaskPayload::DocumentReview(serde_json::from_value(raw).map_err(malformed)?)
            }
            TaskKind::DocumentGenerate => {
                TaskPayload::DocumentGenerate(serde_json::from_value(raw).map_err(malformed)?)
            }
            TaskKind::TemplateReview => {
                TaskPayload::TemplateReview(serde_json::from_value(raw).map_err(malformed)?)
            }
        };
        Ok(payload)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::DocumentParse(_) => TaskKind::DocumentParse,
            TaskPayload::DocumentReview(_) => TaskKind::DocumentReview,
            TaskPayload::DocumentGenerate(_) => TaskKind::DocumentGenerate,
            TaskPayload::TemplateReview(_) => TaskKind::TemplateReview,
        }
    }

    pub fn validate(&self, limits: &PayloadLimits) -> Result<(), ValidationError> {
        match self {
            TaskPayload::DocumentParse(p) => {
                require("document_id", &p.document_id)?;
                require("file_name", &p.file_name)?;
                check_content(&p.content, limits)?;
                let extension = p
                    .file_name
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .unwrap_or_default();
                if !DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
                    return Err(ValidationError::UnsupportedDocumentType(p.file_name.clone()));
                }
            }
            TaskPayload::DocumentReview(p) => {
                require("document_id", &p.document_id)?;
                require("template_id", &p.template_id)?;
                check_content(&p.content, limits)?;
            }
            TaskPayload::DocumentGenerate(p) => {
                require("template_id", &p.template_id)?;
                require("customer_id", &p.customer_id)?;
                if let Some(instructions) = &p.instructions
                    && instructions.len() > limits.max_content_bytes
                {
                    return Err(ValidationError::ContentTooLarge {
                        size: instructions.len(),
                        limit: limits.max_content_bytes,
                    });
                }
            }
            TaskPayload::TemplateReview(p) => {
                require("template_id", &p.template_id)?;
                check_content(&p.content, limits)?;
            }
        }
        Ok(())
    }

    /// Input size in provider units (characters of text sent).
    pub fn input_units(&self) -> u64 {
        let chars = match self {
            TaskPayload::DocumentParse(p) => p.content.chars().count(),
            TaskPayload::DocumentReview(p) => p.content.chars().count(),
            TaskPayload::DocumentGenerate(p) => {
                p.instructions.as_deref().map_or(0, |s| s.chars().count())
            }
            TaskPayload::TemplateReview(p) => p.content.chars().count(),
        };
        chars as u64
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(())
}

fn check_content(content: &str, limits: &PayloadLimits) -> Result<(), ValidationError> {
    require("content", content)?;
    if content.len() > limits.max_content_bytes {
        return Err(ValidationError::ContentTooLarge {
            size: content.len(),
            limit: limits.max_content_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_parse_payload() {
        let payload = TaskPayload::decode(
            TaskKind::DocumentParse,
            json!({"document_id": "d-1", "file_name": "manual.pdf", "content": "scope"}),
        )
        .unwrap();
        assert_eq!(payload.kind(), TaskKind::DocumentParse);
        payload.validate(&PayloadLimits::default()).unwrap();
        assert_eq!(payload.input_units(), 5);
    }

    #[test]
    fn review_without_template_is_malformed() {
        let err = TaskPayload::decode(
            TaskKind::DocumentReview,
            json!({"document_id": "d-1", "content": "text"}),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));
    }

    #[test]
    fn blank_template_binding_is_rejected() {
        let payload = TaskPayload::decode(
            TaskKind::DocumentGenerate,
            json!({"template_id": "  ", "customer_id": "c-9"}),
        )
        .unwrap();
        assert_eq!(
            payload.validate(&PayloadLimits::default()),
            Err(ValidationError::EmptyField("template_id"))
        );
    }

    #[test]
    fn oversized_content_is_rejected() {
        let payload = TaskPayload::TemplateReview(TemplateReview {
            template_id: "t-1".into(),
            content: "x".repeat(11),
        });
        let err = payload
            .validate(&PayloadLimits {
                max_content_bytes: 10,
            })
            .unwrap_err();
        assert_eq!(err, ValidationError::ContentTooLarge { size: 11, limit: 10 });
    }

    #[test]
    fn unknown_document_type_is_rejected() {
        let payload = TaskPayload::DocumentParse(DocumentParse {
            document_id: "d-1".into(),
            file_name: "virus.exe".into(),
            content: "MZ".into(),
        });
        assert!(matches!(
            payload.validate(&PayloadLimits::default()),
            Err(ValidationError::UnsupportedDocumentType(_))
        ));
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = TaskPayload::TemplateReview(TemplateReview {
            template_id: "t-1".into(),
            content: "c".into(),
        });
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["kind"], "template-review");
        assert_eq!(v["payload"]["template_id"], "t-1");
    }
}
