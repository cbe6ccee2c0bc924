//! Plan Model - Ingestion Boundary
//!
//! Generator output is parsed into a closed set of types here. Anything that does
//! not match the wire shape is a `PlanFormat` error and never reaches validation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Text,
    Binary,
}

/// Transport encoding of `content` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    Text(String),
    Binary(Vec<u8>),
}

impl EntryContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EntryContent::Text(s) => s.as_bytes(),
            EntryContent::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            EntryContent::Text(_) => EntryKind::Text,
            EntryContent::Binary(_) => EntryKind::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: EntryContent,
    pub declared_type: Option<String>,
}

impl FileEntry {
    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: EntryContent::Text(content.into()),
            declared_type: None,
        }
    }

    pub fn binary(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: EntryContent::Binary(bytes.into()),
            declared_type: None,
        }
    }

    pub fn with_declared_type(mut self, declared_type: impl Into<String>) -> Self {
        self.declared_type = Some(declared_type.into());
        self
    }

    pub fn kind(&self) -> EntryKind {
        self.content.kind()
    }

    /// Decoded payload size in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<FileEntry>,
    pub summary: String,
}

/// Wire shape of a plan as produced by the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePlan {
    pub entries: Vec<WireEntry>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Encoding,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
}

impl Plan {
    pub fn new(entries: Vec<FileEntry>, summary: impl Into<String>) -> Self {
        Self {
            entries,
            summary: summary.into(),
        }
    }

    /// Parse a plan from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let wire: WirePlan = serde_json::from_str(json)
            .map_err(|e| PipelineError::PlanFormat(format!("invalid plan JSON: {}", e)))?;
        Self::from_wire(wire)
    }

    /// Parse a plan out of raw generator text.
    ///
    /// Generators tend to wrap the object in prose, so only the span from the first
    /// `{` to the last `}` is parsed.
    pub fn from_generator_output(raw: &str) -> Result<Self, PipelineError> {
        let start = raw.find('{');
        let end = raw.rfind('}');
        match (start, end) {
            (Some(start), Some(end)) if start < end => Self::from_json(&raw[start..=end]),
            _ => Err(PipelineError::PlanFormat(
                "generator output contains no JSON object".to_string(),
            )),
        }
    }

    pub fn from_wire(wire: WirePlan) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(wire.entries.len());

        for (index, raw) in wire.entries.into_iter().enumerate() {
            if !seen.insert(raw.path.clone()) {
                return Err(PipelineError::PlanFormat(format!(
                    "duplicate path {} at entry {}",
                    raw.path, index
                )));
            }
            entries.push(decode_entry(index, raw)?);
        }

        Ok(Self {
            entries,
            summary: wire.summary,
        })
    }

    /// Wire form with binary payloads base64-encoded; used for hashing and replay.
    pub fn to_wire(&self) -> WirePlan {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let (content, encoding) = match &e.content {
                    EntryContent::Text(s) => (s.clone(), Encoding::Utf8),
                    EntryContent::Binary(b) => (STANDARD.encode(b), Encoding::Base64),
                };
                WireEntry {
                    path: e.path.clone(),
                    content,
                    encoding,
                    kind: e.kind(),
                    declared_type: e.declared_type.clone(),
                }
            })
            .collect();

        WirePlan {
            entries,
            summary: self.summary.clone(),
        }
    }
}

fn decode_entry(index: usize, raw: WireEntry) -> Result<FileEntry, PipelineError> {
    let content = match (raw.kind, raw.encoding) {
        (EntryKind::Text, Encoding::Utf8) => EntryContent::Text(raw.content),
        (EntryKind::Text, Encoding::Base64) => {
            let bytes = decode_base64(index, &raw.path, &raw.content)?;
            let text = String::from_utf8(bytes).map_err(|_| {
                PipelineError::PlanFormat(format!(
                    "entry {} ({}) is declared text but is not valid UTF-8",
                    index, raw.path
                ))
            })?;
            EntryContent::Text(text)
        }
        (EntryKind::Binary, Encoding::Base64) => {
            EntryContent::Binary(decode_base64(index, &raw.path, &raw.content)?)
        }
        (EntryKind::Binary, Encoding::Utf8) => EntryContent::Binary(raw.content.into_bytes()),
    };

    Ok(FileEntry {
        path: raw.path,
        content,
        declared_type: raw.declared_type,
    })
}

fn decode_base64(index: usize, path: &str, content: &str) -> Result<Vec<u8>, PipelineError> {
    // Generators wrap long base64 strings; whitespace is not part of the payload.
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact.as_bytes()).map_err(|e| {
        PipelineError::PlanFormat(format!(
            "entry {} ({}) has invalid base64 content: {}",
            index, path, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_binary_entries() {
        let json = r#"{
            "entries": [
                {"path": "index.html", "content": "<p>hi</p>", "kind": "text", "declaredType": "html"},
                {"path": "img.bin", "content": "AAEC", "encoding": "base64", "kind": "binary"}
            ],
            "summary": "two files"
        }"#;
        let plan = Plan::from_json(json).unwrap();
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].content, EntryContent::Text("<p>hi</p>".into()));
        assert_eq!(plan.entries[0].declared_type.as_deref(), Some("html"));
        assert_eq!(plan.entries[1].content, EntryContent::Binary(vec![0, 1, 2]));
        assert_eq!(plan.summary, "two files");
    }

    #[test]
    fn test_wrong_shape_is_plan_format_error() {
        let err = Plan::from_json(r#"{"files": []}"#).unwrap_err();
        assert!(matches!(err, PipelineError::PlanFormat(_)));

        let err = Plan::from_json(r#"{"entries": [{"path": "a", "kind": "video", "content": "x"}]}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PlanFormat(_)));
    }

    #[test]
    fn test_bad_base64_is_rejected_at_ingestion() {
        let json = r#"{"entries": [{"path": "a.png", "content": "***", "encoding": "base64", "kind": "binary"}], "summary": ""}"#;
        let err = Plan::from_json(json).unwrap_err();
        assert!(err.to_string().contains("invalid base64"));
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let json = r#"{"entries": [
            {"path": "a.css", "content": "x", "kind": "text"},
            {"path": "a.css", "content": "y", "kind": "text"}
        ]}"#;
        let err = Plan::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate path"));
    }

    #[test]
    fn test_generator_output_with_prose() {
        let raw = "Sure! Here is the plan:\n{\"entries\": [{\"path\": \"a.txt\", \"content\": \"x\", \"kind\": \"text\"}], \"summary\": \"s\"}\nEnjoy.";
        let plan = Plan::from_generator_output(raw).unwrap();
        assert_eq!(plan.entries[0].path, "a.txt");

        let err = Plan::from_generator_output("no json here").unwrap_err();
        assert!(matches!(err, PipelineError::PlanFormat(_)));
    }

    #[test]
    fn test_wire_form_reencodes_binary() {
        let plan = Plan::new(vec![FileEntry::binary("x.bin", vec![0xff, 0x00])], "s");
        let wire = plan.to_wire();
        assert_eq!(wire.entries[0].encoding, Encoding::Base64);
        assert_eq!(Plan::from_wire(wire).unwrap(), plan);
    }
}
