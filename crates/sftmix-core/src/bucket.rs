use std::fmt;

use serde::{Deserialize, Serialize};

/// Capability bucket assigned to every canonical record.
///
/// The set is closed: extending it means touching the classifier and every
/// profile weight table at the same time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Instruction,
    ToolUse,
    Code,
    CodeDebugging,
    CotMath,
    Analytical,
    ReasoningTrace,
    Creative,
    Factual,
    MultiturnDialog,
    PsychologyEmotional,
    AdversarialMoral,
    RedTeam,
    SymbolicReasoning,
    Philosophical,
    DarkProtector,
    DarkHumor,
    DarkPhilosophy,
    Esoteric,
    Unknown,
}

impl Bucket {
    pub const ALL: [Self; 20] = [
        Self::Instruction,
        Self::ToolUse,
        Self::Code,
        Self::CodeDebugging,
        Self::CotMath,
        Self::Analytical,
        Self::ReasoningTrace,
        Self::Creative,
        Self::Factual,
        Self::MultiturnDialog,
        Self::PsychologyEmotional,
        Self::AdversarialMoral,
        Self::RedTeam,
        Self::SymbolicReasoning,
        Self::Philosophical,
        Self::DarkProtector,
        Self::DarkHumor,
        Self::DarkPhilosophy,
        Self::Esoteric,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::ToolUse => "tool_use",
            Self::Code => "code",
            Self::CodeDebugging => "code_debugging",
            Self::CotMath => "cot_math",
            Self::Analytical => "analytical",
            Self::ReasoningTrace => "reasoning_trace",
            Self::Creative => "creative",
            Self::Factual => "factual",
            Self::MultiturnDialog => "multiturn_dialog",
            Self::PsychologyEmotional => "psychology_emotional",
            Self::AdversarialMoral => "adversarial_moral",
            Self::RedTeam => "red_team",
            Self::SymbolicReasoning => "symbolic_reasoning",
            Self::Philosophical => "philosophical",
            Self::DarkProtector => "dark_protector",
            Self::DarkHumor => "dark_humor",
            Self::DarkPhilosophy => "dark_philosophy",
            Self::Esoteric => "esoteric",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|b| b.as_str() == s)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source bucket assignment: either a fixed taxonomy value or deferred to
/// the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BucketOverride {
    Auto,
    Fixed(Bucket),
}

impl Default for BucketOverride {
    fn default() -> Self {
        Self::Auto
    }
}

impl TryFrom<String> for BucketOverride {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let v = value.trim();
        if v.is_empty() || v.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        Bucket::from_str_opt(v)
            .map(Self::Fixed)
            .ok_or_else(|| format!("not a taxonomy bucket: {v:?}"))
    }
}

impl From<BucketOverride> for String {
    fn from(value: BucketOverride) -> Self {
        match value {
            BucketOverride::Auto => "auto".to_string(),
            BucketOverride::Fixed(b) => b.as_str().to_string(),
        }
    }
}
