use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The structured coaching script returned to the parent. The model is
/// instructed to produce exactly this shape as JSON; `validate` is the
/// gate between "the model said something" and "we will serve it".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LessonPlan {
    pub subject: String,
    pub questions: QuestionLadder,
    pub behavioral_tip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_approach: Option<String>,
}

/// Three guided questions of increasing depth. None of them may state
/// the answer to the child's actual problem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionLadder {
    pub foundation: String,
    pub bridge: String,
    pub mastery: String,
}

/// An uploaded homework photo as received, bytes plus the declared
/// content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum GradeLevel {
    #[strum(serialize = "K-2")]
    #[serde(rename = "K-2")]
    EarlyElementary,
    #[strum(serialize = "3-5")]
    #[serde(rename = "3-5")]
    UpperElementary,
    #[strum(serialize = "6-8")]
    #[serde(rename = "6-8")]
    MiddleSchool,
    #[strum(serialize = "9-12")]
    #[serde(rename = "9-12")]
    HighSchool,
}

impl LessonPlan {
    /// Parse a model reply into a lesson, stripping the markdown fences
    /// models like to wrap JSON in.
    pub fn from_model_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(strip_code_fences(text))
    }

    /// Required-fields check. Returns the list of violations so callers
    /// can log what exactly the model got wrong.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.subject.trim().is_empty() {
            errors.push("subject is empty".to_string());
        }
        for (name, question) in [
            ("foundation", &self.questions.foundation),
            ("bridge", &self.questions.bridge),
            ("mastery", &self.questions.mastery),
        ] {
            if question.trim().len() < MIN_QUESTION_LEN {
                errors.push(format!("{} question is missing or trivial", name));
            }
        }
        if self.behavioral_tip.trim().is_empty() {
            errors.push("behavioral_tip is empty".to_string());
        }
        if let Some(steps) = &self.solution_steps {
            if steps.iter().any(|s| s.trim().is_empty()) {
                errors.push("solution_steps contains an empty step".to_string());
            }
        }

        errors
    }
}

// A real guided question is a sentence, not a word. Ten characters
// rejects "yes", "idk" and bare punctuation without judging content.
const MIN_QUESTION_LEN: usize = 10;

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Opening fence may carry a language tag ("```json").
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}
