use serde_json::Value;

use sftmix_core::classify::classify;
use sftmix_core::record::{canonicalize, CanonicalRecord, RawRecord};
use sftmix_core::source::SourceDescriptor;

/// Reduce a raw record to canonical form: extract the triple, stamp the
/// source label, classify, and fold any length trait into `_traits`.
///
/// `None` means the record has no usable instruction/output and is dropped
/// as `missing_instruction_or_output` by the caller.
pub fn normalize(raw: &RawRecord, desc: &SourceDescriptor) -> Option<CanonicalRecord> {
    let extracted = canonicalize(raw)?;
    let classified = classify(&extracted, desc.bucket);
    let source = extracted
        .meta_str("_source")
        .map(str::to_string)
        .unwrap_or_else(|| desc.label.clone());

    let mut meta = extracted.meta;
    meta.remove("_category");
    meta.remove("_source");
    if let Some(hint) = classified.trait_hint {
        append_trait(&mut meta, hint);
    }

    Some(CanonicalRecord {
        instruction: extracted.instruction,
        input: extracted.input,
        output: extracted.output,
        source,
        category: classified.bucket,
        meta,
    })
}

fn append_trait(meta: &mut std::collections::BTreeMap<String, Value>, hint: &str) {
    let hint_value = Value::String(hint.to_string());
    match meta.get_mut("_traits") {
        None => {
            meta.insert("_traits".to_string(), Value::Array(vec![hint_value]));
        }
        Some(Value::Array(traits)) => {
            if !traits.contains(&hint_value) {
                traits.push(hint_value);
            }
        }
        Some(existing @ Value::String(_)) => {
            let prior = existing.clone();
            if prior != hint_value {
                *existing = Value::Array(vec![prior, hint_value]);
            }
        }
        Some(_) => {}
    }
}
