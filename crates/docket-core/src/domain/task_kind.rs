//! TaskKind - 実行できる仕事の種類
//!
//! Wire names are kebab-case (`document-parse`, ...) and double as queue
//! stream suffixes. Config keys coming from the environment arrive in
//! snake_case, hence the aliases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Extract structure and clauses from an uploaded document.
    #[serde(alias = "document_parse")]
    DocumentParse,
    /// Review a customer document against an ISO template.
    #[serde(alias = "document_review")]
    DocumentReview,
    /// Generate a document for a customer from a template.
    #[serde(alias = "document_generate")]
    DocumentGenerate,
    /// Review a template on its own.
    #[serde(alias = "template_review")]
    TemplateReview,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::DocumentParse,
        TaskKind::DocumentReview,
        TaskKind::DocumentGenerate,
        TaskKind::TemplateReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::DocumentParse => "document-parse",
            TaskKind::DocumentReview => "document-review",
            TaskKind::DocumentGenerate => "document-generate",
            TaskKind::TemplateReview => "template-review",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}
