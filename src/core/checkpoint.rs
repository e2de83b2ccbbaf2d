//! Checkpoint requirements mined from indexed workflow documents.
//!
//! A phase's checkpoint is whatever its documents say must be provided:
//! lines such as ``must provide `functions_count` (total number)`` become
//! typed, validated evidence fields.

use crate::core::rag::{RagEngine, SearchFilters};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

const EVIDENCE_INDICATORS: &[&str] = &[
    "must provide",
    "required:",
    "evidence:",
    "checkpoint:",
    "verify that",
    "proof of",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Str,
    List,
    Bool,
    Dict,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Str => "str",
            FieldType::List => "list",
            FieldType::Bool => "bool",
            FieldType::Dict => "dict",
        }
    }

    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::Int => value.is_i64() || value.is_u64() || value.is_boolean(),
            FieldType::Str => value.is_string(),
            FieldType::List => value.is_array(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Dict => value.is_object(),
        }
    }
}

/// Name of a JSON value's type in the same vocabulary as `FieldType`.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(n) if n.is_f64() => "float",
        JsonValue::Number(_) => "int",
        JsonValue::String(_) => "str",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "dict",
    }
}

fn json_len(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::String(s) => Some(s.chars().count()),
        JsonValue::Array(a) => Some(a.len()),
        JsonValue::Object(o) => Some(o.len()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
    /// Positive number, or a non-empty collection/string.
    Positive,
    NonEmpty,
    Optional,
    Present,
}

impl Validator {
    pub fn check(&self, value: &JsonValue) -> bool {
        match self {
            Validator::Positive => match value {
                JsonValue::Number(n) => n.as_f64().is_some_and(|f| f > 0.0),
                JsonValue::Bool(b) => *b,
                other => json_len(other).is_some_and(|l| l > 0),
            },
            Validator::NonEmpty => match json_len(value) {
                Some(l) => l > 0,
                None => !value.is_null(),
            },
            Validator::Optional => true,
            Validator::Present => !value.is_null(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceRequirement {
    pub field_type: FieldType,
    pub validator: Validator,
    pub description: String,
}

/// Required evidence keyed by field name, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointRequirements {
    pub required_evidence: Vec<(String, EvidenceRequirement)>,
}

impl CheckpointRequirements {
    pub fn is_empty(&self) -> bool {
        self.required_evidence.is_empty()
    }

    fn insert(&mut self, field: String, req: EvidenceRequirement) {
        match self.required_evidence.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = req,
            None => self.required_evidence.push((field, req)),
        }
    }
}

pub fn is_evidence_requirement(line: &str) -> bool {
    let lower = line.to_lowercase();
    EVIDENCE_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Field name from `` `code` ``, `**bold**`, or the first snake_case word.
pub fn extract_field_name(line: &str) -> Option<String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    for word in &words {
        if word.len() > 2 && word.starts_with('`') && word.ends_with('`') {
            return Some(word.trim_matches('`').to_string());
        }
        if word.len() > 4 && word.starts_with("**") && word.ends_with("**") {
            return Some(word.trim_matches('*').to_lowercase());
        }
    }
    words
        .iter()
        .find(|w| {
            w.contains('_')
                && w.chars()
                    .filter(|c| *c != '_' && *c != '-')
                    .all(char::is_alphanumeric)
        })
        .map(|w| w.trim_matches(|c| matches!(c, ':' | '`' | '"' | '\'')).to_string())
        .filter(|w| !w.is_empty())
}

pub fn infer_field_type(line: &str, context: &[&str]) -> FieldType {
    let lower = line.to_lowercase();
    let context_text = context.join(" ").to_lowercase();
    let line_has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if line_has(&["count", "number", "quantity", "total", "sum"]) {
        FieldType::Int
    } else if ["list", "array", "collection", "functions", "methods"]
        .iter()
        .any(|w| lower.contains(w) || context_text.contains(w))
    {
        FieldType::List
    } else if line_has(&["flag", "boolean", "true/false"]) {
        FieldType::Bool
    } else if line_has(&["dict", "mapping", "object"]) {
        FieldType::Dict
    } else {
        FieldType::Str
    }
}

pub fn extract_validator(line: &str) -> Validator {
    let lower = line.to_lowercase();
    let has = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));
    if has(&["greater than", "at least", "non-zero", "minimum"]) {
        Validator::Positive
    } else if has(&["non-empty", "must contain", "cannot be empty"]) {
        Validator::NonEmpty
    } else if has(&["optional", "may be empty"]) {
        Validator::Optional
    } else {
        Validator::Present
    }
}

fn extract_description(line: &str) -> String {
    line.trim()
        .trim_matches(|c| matches!(c, '*' | '#' | '-' | ':' | '`' | '"'))
        .trim()
        .to_string()
}

/// Scans document text for requirement lines.
pub fn parse_requirements<'a, I>(contents: I) -> CheckpointRequirements
where
    I: IntoIterator<Item = &'a str>,
{
    let mut reqs = CheckpointRequirements::default();
    for content in contents {
        let lines: Vec<&str> = content.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if !is_evidence_requirement(line) {
                continue;
            }
            let Some(field) = extract_field_name(line) else {
                continue;
            };
            let context = &lines[i..(i + 3).min(lines.len())];
            reqs.insert(
                field,
                EvidenceRequirement {
                    field_type: infer_field_type(line, context),
                    validator: extract_validator(line),
                    description: extract_description(line),
                },
            );
        }
    }
    reqs
}

/// Checks evidence against requirements; returns pass/fail and the failures.
pub fn validate_evidence(
    requirements: &CheckpointRequirements,
    evidence: &Map<String, JsonValue>,
) -> (bool, Vec<String>) {
    let mut missing = Vec::new();
    for (field, req) in &requirements.required_evidence {
        let Some(value) = evidence.get(field) else {
            missing.push(format!("{} (required: {})", field, req.description));
            continue;
        };
        if !req.field_type.matches(value) {
            missing.push(format!(
                "{} (wrong type: expected {}, got {})",
                field,
                req.field_type.name(),
                json_type_name(value)
            ));
            continue;
        }
        if !req.validator.check(value) {
            missing.push(format!("{} (validation failed: {})", field, req.description));
        }
    }
    (missing.is_empty(), missing)
}

#[derive(Default)]
pub struct CheckpointLoader {
    cache: HashMap<(String, u32), CheckpointRequirements>,
}

impl CheckpointLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_checkpoint_requirements(
        &mut self,
        rag: &RagEngine,
        workflow_type: &str,
        phase: u32,
    ) -> CheckpointRequirements {
        let key = (workflow_type.to_string(), phase);
        if let Some(hit) = self.cache.get(&key) {
            debug!(workflow_type, phase, "Checkpoint cache hit");
            return hit.clone();
        }

        let query = format!("{} Phase {} checkpoint requirements evidence", workflow_type, phase);
        match rag.search(&query, 3, &SearchFilters::for_workflow(workflow_type, phase)) {
            Ok(result) => {
                let reqs = parse_requirements(result.chunks.iter().map(|c| c.chunk.content.as_str()));
                info!(
                    workflow_type,
                    phase,
                    fields = reqs.required_evidence.len(),
                    "Loaded checkpoint requirements"
                );
                self.cache.insert(key, reqs.clone());
                reqs
            }
            Err(e) => {
                error!(error = %e, "Failed to load checkpoint requirements");
                CheckpointRequirements::default()
            }
        }
    }

    /// Requirements empty means the checkpoint passes.
    pub fn validate(
        &mut self,
        rag: &RagEngine,
        workflow_type: &str,
        phase: u32,
        evidence: &Map<String, JsonValue>,
    ) -> (bool, Vec<String>) {
        let reqs = self.load_checkpoint_requirements(rag, workflow_type, phase);
        if reqs.is_empty() {
            warn!(
                workflow_type,
                phase, "No checkpoint requirements found, passing by default"
            );
            return (true, Vec::new());
        }
        validate_evidence(&reqs, evidence)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
