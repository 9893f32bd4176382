use std::collections::BTreeMap;

use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::ParseError;
use crate::models::UseCaseState;

/// A top-level entry of a values file. Only mappings can be use cases.
#[derive(Deserialize)]
#[serde(untagged)]
enum Entry {
    Fields(BTreeMap<String, Value>),
    Other(IgnoredAny),
}

/// Parse a tracked values file into its use cases.
///
/// Every top-level key whose value is a mapping with both `model` and
/// `prompt` is a use case. Other keys are ignored. Repeated keys keep their
/// last occurrence, at the top level and inside a use case, and `<<` merge
/// keys are resolved.
pub fn parse_usecases(content: &str) -> Result<Vec<UseCaseState>, ParseError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    // Maps rather than `Value`: a `Value` mapping rejects duplicate keys.
    let document: BTreeMap<String, Entry> = serde_yaml::from_str(content)?;

    Ok(document
        .into_iter()
        .filter(|(name, _)| name != "<<")
        .filter_map(|(name, entry)| match entry {
            Entry::Fields(fields) => usecase_from(name, fields),
            Entry::Other(_) => None,
        })
        .collect())
}

/// Lenient variant used while scanning history: an unparseable snapshot
/// contributes no use cases.
pub fn extract_usecases(content: &str) -> Vec<UseCaseState> {
    match parse_usecases(content) {
        Ok(usecases) => usecases,
        Err(e) => {
            tracing::warn!("Skipping unparseable values file: {}", e);
            Vec::new()
        }
    }
}

fn usecase_from(name: String, fields: BTreeMap<String, Value>) -> Option<UseCaseState> {
    let mut body: Value = Value::Mapping(
        fields
            .into_iter()
            .map(|(key, value)| (Value::String(key), value))
            .collect(),
    );
    if let Err(e) = body.apply_merge() {
        tracing::debug!("Ignoring {}: {}", name, e);
        return None;
    }

    let fields = body.as_mapping()?;
    let model = fields.get("model")?;
    let prompt = fields.get("prompt")?;

    Some(UseCaseState {
        usecase: name,
        model: scalar_text(model),
        prompt: scalar_text(prompt).trim().to_string(),
        enabled: fields.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        temperature: fields.get("temperature").and_then(Value::as_f64),
        top_k: fields.get("top_k").and_then(Value::as_i64),
        top_p: fields.get("top_p").and_then(Value::as_f64),
        max_tokens: fields.get("max_tokens").and_then(Value::as_i64),
    })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
