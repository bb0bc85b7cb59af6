use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Selectable answer of an operator question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    /// Code sent back when this option is chosen.
    pub code: i64,
    /// Option label.
    pub text: String,
}

/// Question raised by a paused mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Question id, unique within the mission.
    pub id: u64,
    /// Component that raised the question.
    #[serde(default)]
    pub source: String,
    /// Prompt text.
    pub text: String,
    /// Available answers.
    pub options: Vec<AnswerOption>,
}

/// Outcome of applying the policy to one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionDecision {
    /// The question only asks the mission to wait; leave it alone.
    Wait,
    /// Send this answer code.
    Answer(i64),
    /// No option to pick.
    Unanswerable,
}

/// Fixed default policy for operator questions.
///
/// Benign wait prompts are left alone. Anything else is answered with the
/// first option mentioning the keyword (case-insensitive), falling back to
/// the first option.
#[derive(Debug, Clone)]
pub struct QuestionPolicy {
    benign: Option<Regex>,
    keyword: String,
}

impl QuestionPolicy {
    /// Builds the policy from a benign-question pattern and an answer keyword.
    pub fn new(benign_pattern: &str, keyword: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            benign: Some(Regex::new(benign_pattern)?),
            keyword: keyword.into().to_lowercase(),
        })
    }

    /// Same pattern, different keyword.
    #[must_use]
    pub fn with_keyword(&self, keyword: &str) -> Self {
        Self {
            benign: self.benign.clone(),
            keyword: keyword.to_lowercase(),
        }
    }

    /// Whether the prompt is a benign wait condition.
    #[must_use]
    pub fn is_benign(&self, question: &Question) -> bool {
        self.benign
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&question.text))
    }

    /// Applies the policy.
    #[must_use]
    pub fn decide(&self, question: &Question) -> QuestionDecision {
        if self.is_benign(question) {
            return QuestionDecision::Wait;
        }
        question
            .options
            .iter()
            .find(|option| option.text.to_lowercase().contains(&self.keyword))
            .or_else(|| question.options.first())
            .map_or(QuestionDecision::Unanswerable, |option| {
                QuestionDecision::Answer(option.code)
            })
    }
}

impl Default for QuestionPolicy {
    fn default() -> Self {
        Self {
            benign: Regex::new(r"(?i)\bwait(ing)?\b").ok(),
            keyword: "skip".into(),
        }
    }
}

/// Remembers which questions were answered so a question that survives its
/// answer can be detected on the next poll.
#[derive(Debug, Default)]
pub struct QuestionLedger {
    answered: HashSet<u64>,
}

impl QuestionLedger {
    /// Records an answered question.
    pub fn record(&mut self, id: u64) {
        self.answered.insert(id);
    }

    /// Whether the question was already answered.
    #[must_use]
    pub fn was_answered(&self, id: u64) -> bool {
        self.answered.contains(&id)
    }
}
