use crate::bucket::{Bucket, BucketOverride};
use crate::record::Extracted;

/// Classifier outcome: the assigned bucket plus an optional length trait
/// (`verbose`/`brief`) that the normalizer appends to `_traits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub bucket: Bucket,
    pub trait_hint: Option<&'static str>,
}

impl Classified {
    fn plain(bucket: Bucket) -> Self {
        Self {
            bucket,
            trait_hint: None,
        }
    }
}

const REFUSAL_MARKERS: [&str; 4] = ["i cannot", "i can't", "cannot assist", "inappropriate"];

const TOOL_MARKERS: [&str; 5] = [
    "<tool>",
    "functioncall",
    "tool_use:",
    "<functioncall>",
    "\"parameters\":",
];

const CODE_MARKERS: [&str; 14] = [
    "```python",
    "```rust",
    "```javascript",
    "```typescript",
    "```java",
    "```cpp",
    "```c",
    "```go",
    "```sql",
    "```bash",
    "def ",
    "class ",
    "import ",
    "function (",
];

const DEBUG_MARKERS: [&str; 4] = ["bug", "debug", "error", "fix"];

const COT_MARKERS: [&str; 4] = ["let's think", "step 1", "step 2", "<thinking>"];

const MATH_MARKERS: [&str; 4] = ["solve", "equation", "math", "calculate"];

const CREATIVE_MARKERS: [&str; 4] = ["story", "poem", "imagine", "narrative"];

const FACTUAL_MARKERS: [&str; 3] = ["according to", "wikipedia", "research shows"];

/// Assign a capability bucket.
///
/// The rule list is ordered and first-match-wins; its order is canonical
/// because classifier output feeds the manifest and the mix. A record with a
/// non-empty instruction and output never classifies as `unknown`.
pub fn classify(record: &Extracted, bucket_override: BucketOverride) -> Classified {
    if let BucketOverride::Fixed(bucket) = bucket_override {
        return Classified::plain(bucket);
    }

    // An explicit category tag wins over every heuristic. `unknown` is the
    // absence of a classification, not a classification, so it falls through
    // to the rules below (that is what recategorize relies on).
    if let Some(tag) = record.meta_str("_category") {
        if let Some(bucket) = Bucket::from_str_opt(tag) {
            if bucket != Bucket::Unknown {
                return Classified::plain(bucket);
            }
        }
    }

    let haystack = format!("{} {}", record.instruction, record.output).to_lowercase();

    if contains_any(&haystack, &REFUSAL_MARKERS) {
        return Classified::plain(Bucket::RedTeam);
    }

    if contains_any(&haystack, &TOOL_MARKERS) {
        return Classified::plain(Bucket::ToolUse);
    }

    if contains_any(&haystack, &CODE_MARKERS) {
        if contains_any(&haystack, &DEBUG_MARKERS) {
            return Classified::plain(Bucket::CodeDebugging);
        }
        return Classified::plain(Bucket::Code);
    }

    if contains_any(&haystack, &COT_MARKERS) {
        if contains_any(&haystack, &MATH_MARKERS) {
            return Classified::plain(Bucket::CotMath);
        }
        return Classified::plain(Bucket::Analytical);
    }

    if contains_any(&haystack, &CREATIVE_MARKERS) {
        return Classified::plain(Bucket::Creative);
    }

    if contains_any(&haystack, &FACTUAL_MARKERS) {
        return Classified::plain(Bucket::Factual);
    }

    let mean = mean_sentence_words(&haystack);
    if mean > 25.0 {
        return Classified {
            bucket: Bucket::Instruction,
            trait_hint: Some("verbose"),
        };
    }
    if mean < 10.0 {
        return Classified {
            bucket: Bucket::Instruction,
            trait_hint: Some("brief"),
        };
    }

    Classified::plain(Bucket::Instruction)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn mean_sentence_words(text: &str) -> f64 {
    let mut total_words = 0usize;
    let mut sentences = 0usize;
    for sentence in text.split(['.', '!', '?']) {
        let words = sentence.split_whitespace().count();
        if words > 0 {
            total_words += words;
            sentences += 1;
        }
    }
    if sentences == 0 {
        return 0.0;
    }
    total_words as f64 / sentences as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rec(instruction: &str, output: &str) -> Extracted {
        Extracted {
            instruction: instruction.to_string(),
            input: String::new(),
            output: output.to_string(),
            meta: BTreeMap::new(),
        }
    }

    fn rec_with_category(instruction: &str, output: &str, category: &str) -> Extracted {
        let mut r = rec(instruction, output);
        r.meta.insert(
            "_category".to_string(),
            serde_json::Value::String(category.to_string()),
        );
        r
    }

    #[test]
    fn fixed_override_wins() {
        let c = classify(
            &rec("write a poem", "roses are red"),
            BucketOverride::Fixed(Bucket::Esoteric),
        );
        assert_eq!(c.bucket, Bucket::Esoteric);
    }

    #[test]
    fn explicit_category_tag_is_stable() {
        for bucket in Bucket::ALL {
            if bucket == Bucket::Unknown {
                continue;
            }
            let r = rec_with_category("anything at all here", "and an answer", bucket.as_str());
            assert_eq!(classify(&r, BucketOverride::Auto).bucket, bucket);
        }
    }

    #[test]
    fn unknown_tag_falls_through_to_rules() {
        let r = rec_with_category("write code", "```python\nprint(1)\n```", "unknown");
        assert_eq!(classify(&r, BucketOverride::Auto).bucket, Bucket::Code);
    }

    #[test]
    fn refusal_beats_code_fence() {
        // Rule order is canonical: a refusal inside a code block is red_team.
        let r = rec("do the bad thing", "I cannot assist with that. ```python\nx```");
        assert_eq!(classify(&r, BucketOverride::Auto).bucket, Bucket::RedTeam);
    }

    #[test]
    fn tool_markers() {
        let r = rec("get the weather", "<functioncall> {\"name\": \"weather\"}");
        assert_eq!(classify(&r, BucketOverride::Auto).bucket, Bucket::ToolUse);
    }

    #[test]
    fn code_and_code_debugging() {
        let plain = rec("sort a list", "```python\nsorted(xs)\n```");
        assert_eq!(classify(&plain, BucketOverride::Auto).bucket, Bucket::Code);

        let debugging = rec("why does this crash", "```python\nxs[1]\n``` the bug is an off-by-one, fix the index");
        assert_eq!(
            classify(&debugging, BucketOverride::Auto).bucket,
            Bucket::CodeDebugging
        );
    }

    #[test]
    fn cot_math_vs_analytical() {
        let math = rec("solve 2x + 1 = 5", "Let's think step by step. Step 1: subtract.");
        assert_eq!(classify(&math, BucketOverride::Auto).bucket, Bucket::CotMath);

        let analytical = rec(
            "compare the two plans",
            "Let's think about tradeoffs. Step 1: compare costs.",
        );
        assert_eq!(
            classify(&analytical, BucketOverride::Auto).bucket,
            Bucket::Analytical
        );
    }

    #[test]
    fn creative_and_factual() {
        let c = rec("tell me a story", "once upon a time");
        assert_eq!(classify(&c, BucketOverride::Auto).bucket, Bucket::Creative);

        let f = rec("when was it built", "according to historical records, 1889");
        assert_eq!(classify(&f, BucketOverride::Auto).bucket, Bucket::Factual);
    }

    #[test]
    fn length_heuristics_attach_traits() {
        let brief = rec("greet", "hello there friend");
        let c = classify(&brief, BucketOverride::Auto);
        assert_eq!(c.bucket, Bucket::Instruction);
        assert_eq!(c.trait_hint, Some("brief"));

        let long_sentence = "alpha ".repeat(30);
        let verbose = rec("ramble", &long_sentence);
        let c = classify(&verbose, BucketOverride::Auto);
        assert_eq!(c.bucket, Bucket::Instruction);
        assert_eq!(c.trait_hint, Some("verbose"));
    }

    #[test]
    fn never_returns_unknown() {
        let samples = [
            rec("hi", "hello"),
            rec("what is the answer to everything in this big wide world we live in", "forty two, as computed over seven and a half million years of patient deliberation"),
            rec_with_category("x", "y", "unknown"),
        ];
        for s in samples {
            assert_ne!(classify(&s, BucketOverride::Auto).bucket, Bucket::Unknown);
        }
    }
}
