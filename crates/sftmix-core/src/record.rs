use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::bucket::Bucket;

/// Raw record shape as yielded by a source. No schema is assumed; this type
/// never leaks past the normalizer.
pub type RawRecord = serde_json::Map<String, Value>;

const INSTRUCTION_KEYS: [&str; 5] = ["instruction", "prompt", "question", "query", "text"];
const OUTPUT_KEYS: [&str; 6] = ["output", "response", "answer", "completion", "code", "solution"];
const INPUT_KEYS: [&str; 2] = ["input", "context"];

const USER_ROLES: [&str; 2] = ["human", "user"];
const ASSISTANT_ROLES: [&str; 3] = ["gpt", "assistant", "bot"];

/// The instruction/input/output triple plus preserved `_`-prefixed metadata,
/// before a source label and bucket have been attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub instruction: String,
    pub input: String,
    pub output: String,
    pub meta: BTreeMap<String, Value>,
}

impl Extracted {
    /// Value of a `_`-prefixed metadata key when it is a non-empty string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        match self.meta.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

/// Reduce a raw record to the canonical triple, or `None` when no non-empty
/// instruction and output can be extracted.
pub fn canonicalize(raw: &RawRecord) -> Option<Extracted> {
    let mut instruction = first_non_empty(raw, &INSTRUCTION_KEYS);
    let mut output = first_non_empty(raw, &OUTPUT_KEYS);
    let input = first_non_empty(raw, &INPUT_KEYS);

    if instruction.is_empty() && output.is_empty() {
        if let Some((i, o)) = extract_turns(raw.get("conversations"))
            .or_else(|| extract_turns(raw.get("messages")))
        {
            instruction = i;
            output = o;
        }
    }

    if instruction.is_empty() || output.is_empty() {
        return None;
    }

    let meta: BTreeMap<String, Value> = raw
        .iter()
        .filter(|(k, _)| k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(Extracted {
        instruction,
        input,
        output,
        meta,
    })
}

fn first_non_empty(raw: &RawRecord, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = raw.get(*key) {
            let text = coerce_text(v);
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

/// Strings pass through; any other value is coerced to its compact JSON
/// encoding so the fingerprint stays stable across sources.
fn coerce_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

/// Conversational shapes: a list of `{from|role, value|content}` entries.
/// Instruction is the first user-side turn, output the last assistant-side
/// turn.
fn extract_turns(v: Option<&Value>) -> Option<(String, String)> {
    let turns = v?.as_array()?;
    let mut instruction = String::new();
    let mut output = String::new();
    for turn in turns {
        let obj = turn.as_object()?;
        let role = obj
            .get("from")
            .or_else(|| obj.get("role"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let text = obj
            .get("value")
            .or_else(|| obj.get("content"))
            .map(coerce_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        if instruction.is_empty() && USER_ROLES.contains(&role.as_str()) {
            instruction = text;
        } else if ASSISTANT_ROLES.contains(&role.as_str()) {
            output = text;
        }
    }
    if instruction.is_empty() && output.is_empty() {
        None
    } else {
        Some((instruction, output))
    }
}

/// The only record shape that flows past the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
    pub source: String,
    pub category: Bucket,
    /// Preserved `_`-prefixed passthrough metadata. `_category` and `_source`
    /// are owned by the struct fields and overwritten on serialization.
    pub meta: BTreeMap<String, Value>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("instruction must be non-empty")]
    EmptyInstruction,
    #[error("output must be non-empty")]
    EmptyOutput,
    #[error("source must be non-empty")]
    EmptySource,
}

impl CanonicalRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.instruction.trim().is_empty() {
            return Err(RecordError::EmptyInstruction);
        }
        if self.output.trim().is_empty() {
            return Err(RecordError::EmptyOutput);
        }
        if self.source.trim().is_empty() {
            return Err(RecordError::EmptySource);
        }
        Ok(())
    }

    /// Output shape: `instruction`, `input`, `output`, `_category`, `_source`
    /// plus preserved `_`-keys. The map is BTree-backed, so keys serialize in
    /// ascending order and diffs stay stable.
    pub fn to_json_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.meta {
            map.insert(k.clone(), v.clone());
        }
        map.insert(
            "_category".to_string(),
            Value::String(self.category.as_str().to_string()),
        );
        map.insert("_source".to_string(), Value::String(self.source.clone()));
        map.insert(
            "instruction".to_string(),
            Value::String(self.instruction.clone()),
        );
        map.insert("input".to_string(), Value::String(self.input.clone()));
        map.insert("output".to_string(), Value::String(self.output.clone()));
        Value::Object(map)
    }

    pub fn to_jsonl_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    /// Rebuild a canonical record from its serialized form. Used when reading
    /// back spill shards and consolidated corpora; `None` when the value is
    /// not an object or lacks the triple.
    pub fn from_json_value(v: &Value) -> Option<Self> {
        let raw = v.as_object()?;
        let extracted = canonicalize(raw)?;
        let source = extracted.meta_str("_source")?.to_string();
        let category = Bucket::from_str_opt(extracted.meta_str("_category")?)?;
        let mut meta = extracted.meta;
        meta.remove("_category");
        meta.remove("_source");
        Some(Self {
            instruction: extracted.instruction,
            input: extracted.input,
            output: extracted.output,
            source,
            category,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawRecord {
        match v {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn canonicalize_primary_fields() {
        let r = raw(json!({"instruction": " hi ", "output": "hello", "input": "ctx"}));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.instruction, "hi");
        assert_eq!(e.output, "hello");
        assert_eq!(e.input, "ctx");
    }

    #[test]
    fn canonicalize_fallback_chains() {
        let r = raw(json!({"prompt": "ping", "response": "pong"}));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.instruction, "ping");
        assert_eq!(e.output, "pong");

        let r = raw(json!({"question": "q", "answer": "a", "context": "c"}));
        let e = canonicalize(&r).unwrap();
        assert_eq!((e.instruction.as_str(), e.output.as_str(), e.input.as_str()), ("q", "a", "c"));
    }

    #[test]
    fn canonicalize_prefers_earlier_keys() {
        let r = raw(json!({"instruction": "first", "prompt": "second", "output": "o"}));
        assert_eq!(canonicalize(&r).unwrap().instruction, "first");
    }

    #[test]
    fn canonicalize_coerces_non_strings() {
        let r = raw(json!({"instruction": 42, "output": {"k": true}}));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.instruction, "42");
        assert_eq!(e.output, "{\"k\":true}");
    }

    #[test]
    fn canonicalize_conversations_shape() {
        let r = raw(json!({
            "conversations": [
                {"from": "system", "value": "be nice"},
                {"from": "human", "value": "hi"},
                {"from": "gpt", "value": "hello"},
                {"from": "human", "value": "more"},
                {"from": "gpt", "value": "final"}
            ]
        }));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.instruction, "hi");
        assert_eq!(e.output, "final");
    }

    #[test]
    fn canonicalize_messages_shape() {
        let r = raw(json!({
            "messages": [
                {"role": "user", "content": "ask"},
                {"role": "assistant", "content": "tell"}
            ]
        }));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.instruction, "ask");
        assert_eq!(e.output, "tell");
    }

    #[test]
    fn canonicalize_rejects_empty_triple() {
        assert!(canonicalize(&raw(json!({"instruction": "   "}))).is_none());
        assert!(canonicalize(&raw(json!({"output": "alone"}))).is_none());
        assert!(canonicalize(&raw(json!({}))).is_none());
    }

    #[test]
    fn canonicalize_preserves_underscore_meta() {
        let r = raw(json!({
            "instruction": "i",
            "output": "o",
            "_persona": "sage",
            "_verified": true,
            "discard_me": "gone"
        }));
        let e = canonicalize(&r).unwrap();
        assert_eq!(e.meta.get("_persona"), Some(&json!("sage")));
        assert_eq!(e.meta.get("_verified"), Some(&json!(true)));
        assert!(!e.meta.contains_key("discard_me"));
    }

    #[test]
    fn serialized_record_round_trips() -> anyhow::Result<()> {
        let rec = CanonicalRecord {
            instruction: "explain tides".to_string(),
            input: String::new(),
            output: "the moon pulls the ocean".to_string(),
            source: "astro".to_string(),
            category: Bucket::Factual,
            meta: BTreeMap::from([("_persona".to_string(), json!("sage"))]),
        };
        let line = rec.to_jsonl_line()?;
        let value: Value = serde_json::from_str(&line)?;
        let back = CanonicalRecord::from_json_value(&value).unwrap();
        assert_eq!(back, rec);
        Ok(())
    }

    #[test]
    fn serialized_keys_are_sorted() -> anyhow::Result<()> {
        let rec = CanonicalRecord {
            instruction: "i".to_string(),
            input: "in".to_string(),
            output: "o".to_string(),
            source: "s".to_string(),
            category: Bucket::Instruction,
            meta: BTreeMap::new(),
        };
        let line = rec.to_jsonl_line()?;
        assert_eq!(
            line,
            "{\"_category\":\"instruction\",\"_source\":\"s\",\"input\":\"in\",\"instruction\":\"i\",\"output\":\"o\"}"
        );
        Ok(())
    }
}
