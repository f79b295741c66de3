//! # Recognizer Port
//!
//! The narrow interface between the lifecycle manager and whatever actually
//! performs speech recognition. The manager never sees Candle tensors or
//! HuggingFace downloads; it sees a loader that produces a handle and a
//! handle that turns audio samples into text. Tests substitute both with
//! stubs.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A loaded recognition model, ready to transcribe.
///
/// Implementations must be safe to share across sessions. They may either
/// tolerate concurrent `transcribe` calls or serialize them internally;
/// the caller does not care which.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Turn normalized mono 16kHz samples into text.
    async fn transcribe(&self, samples: &[f32]) -> Result<String>;
}

/// Factory for recognizer instances. The slow, fallible part.
#[async_trait]
pub trait RecognizerLoader: Send + Sync {
    /// Construct a recognizer. May download weights, allocate device memory,
    /// and take several seconds; the caller keeps this off any hot path.
    async fn load(&self) -> Result<Arc<dyn Recognizer>>;
}

/// Available Whisper model sizes with their characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace model repository for this size.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate download size in MB, for reporting.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "Fastest, basic accuracy",
            ModelSize::Base => "Fast, good for testing",
            ModelSize::Small => "Balanced speed and accuracy",
            ModelSize::Medium => "Good accuracy, handles technical vocabulary",
            ModelSize::Large => "Best accuracy, slower processing",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow::anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("small".parse::<ModelSize>().unwrap(), ModelSize::Small);
        assert_eq!("MEDIUM".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert!("enormous".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_model_size_round_trip() {
        for size in [
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
            ModelSize::Large,
        ] {
            assert_eq!(size.to_string().parse::<ModelSize>().unwrap(), size);
        }
    }
}
