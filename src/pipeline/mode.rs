//! Pipeline modes.

use crate::executor::ServiceType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which downstream stages a committed utterance flows through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Recognition only; committed text is the final product.
    AsrOnly,
    /// Recognition followed by translation.
    Translate,
    /// Translation followed by speech synthesis.
    #[default]
    TranslateAndSpeak,
    /// Semantic repair, translation and speech synthesis.
    RepairTranslateSpeak,
}

impl PipelineMode {
    /// Downstream services in dispatch order.
    pub fn downstream_services(&self) -> &'static [ServiceType] {
        match self {
            PipelineMode::AsrOnly => &[],
            PipelineMode::Translate => &[ServiceType::Nmt],
            PipelineMode::TranslateAndSpeak => &[ServiceType::Nmt, ServiceType::Tts],
            PipelineMode::RepairTranslateSpeak => &[
                ServiceType::SemanticRepair,
                ServiceType::Nmt,
                ServiceType::Tts,
            ],
        }
    }

    pub fn uses_semantic_repair(&self) -> bool {
        matches!(self, PipelineMode::RepairTranslateSpeak)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::AsrOnly => "asr_only",
            PipelineMode::Translate => "translate",
            PipelineMode::TranslateAndSpeak => "translate_and_speak",
            PipelineMode::RepairTranslateSpeak => "repair_translate_speak",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asr_only" => Ok(PipelineMode::AsrOnly),
            "translate" => Ok(PipelineMode::Translate),
            "translate_and_speak" => Ok(PipelineMode::TranslateAndSpeak),
            "repair_translate_speak" => Ok(PipelineMode::RepairTranslateSpeak),
            other => Err(format!("unknown pipeline mode '{}'", other)),
        }
    }
}
