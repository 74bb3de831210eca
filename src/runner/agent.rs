#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// AI coding agents tasksmith knows how to drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Codex,
    Gemini,
}

impl Agent {
    pub const ALL: [Agent; 3] = [Agent::Claude, Agent::Codex, Agent::Gemini];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Short model aliases accepted on the command line.
    #[must_use]
    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["sonnet", "opus", "haiku"],
            Self::Codex => &["gpt-5-codex", "gpt-5", "o3", "o4-mini"],
            Self::Gemini => &["gemini-2.5-pro", "gemini-2.5-flash"],
        }
    }

    #[must_use]
    pub fn default_model(self) -> &'static str {
        self.models()[0]
    }

    /// Fully qualified model IDs start with one of these.
    fn model_prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude-"],
            Self::Codex => &["gpt-", "o3-", "o4-"],
            Self::Gemini => &["gemini-"],
        }
    }

    pub fn validate_model(self, model: &str) -> Result<(), EngineError> {
        let model = model.trim();
        let known = self.models().contains(&model)
            || self
                .model_prefixes()
                .iter()
                .any(|p| model.len() > p.len() && model.starts_with(p));
        if known {
            Ok(())
        } else {
            Err(EngineError::InvalidModel {
                agent: self.as_str().to_owned(),
                model: model.to_owned(),
                allowed: self.models().join(", "),
            })
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Agent {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or(EngineError::UnknownAgent(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agents_case_insensitively() {
        assert_eq!("Claude".parse::<Agent>().unwrap(), Agent::Claude);
        assert!(matches!(
            "cursor".parse::<Agent>(),
            Err(EngineError::UnknownAgent(a)) if a == "cursor"
        ));
    }

    #[test]
    fn validates_models_per_agent() {
        Agent::Claude.validate_model("opus").unwrap();
        Agent::Claude.validate_model("claude-sonnet-4-5").unwrap();
        Agent::Codex.validate_model("gpt-5-codex").unwrap();
        assert!(Agent::Claude.validate_model("gpt-5").is_err());
        assert!(Agent::Gemini.validate_model("gemini-").is_err());
        assert_eq!(Agent::Gemini.default_model(), "gemini-2.5-pro");
    }
}
