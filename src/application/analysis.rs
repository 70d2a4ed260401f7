use crate::application::entitlement::{Entitlement, QuotaPolicy};
use crate::domain::{GradeLevel, ImagePayload, LessonPlan, QuestionLadder, UserRecord};
use crate::infrastructure::{LessonSource, RepositoryError, UserRepository};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Quota exhausted")]
    QuotaExceeded(Entitlement),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub lesson: LessonPlan,
    pub usage: Entitlement,
    /// True when the fallback lesson was served because the model could
    /// not produce a valid one.
    pub degraded: bool,
}

// Two total calls to the collaborator, then the fallback. Each call is
// already bounded by the client timeout.
const MAX_LESSON_ATTEMPTS: u32 = 2;

pub struct AnalysisService<R, S>
where
    R: UserRepository,
    S: LessonSource,
{
    repo: Arc<R>,
    source: Arc<S>,
    policy: QuotaPolicy,
}

impl<R, S> AnalysisService<R, S>
where
    R: UserRepository,
    S: LessonSource,
{
    pub fn new(repo: Arc<R>, source: Arc<S>, policy: QuotaPolicy) -> Self {
        Self {
            repo,
            source,
            policy,
        }
    }

    /// One homework analysis end to end: entitlement check, bounded
    /// attempt loop against the collaborator, consumption, persistence.
    /// A fallback-served lesson still consumes a scan. Denials and
    /// invalid input never mutate the store.
    pub async fn analyze(
        &self,
        user: &UserRecord,
        image: ImagePayload,
        grade: Option<GradeLevel>,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        validate_image(&image)?;

        let now = Utc::now();
        let entitlement = self.policy.evaluate(user, now);
        if !entitlement.allowed {
            info!("Analysis denied for {}: quota exhausted", user.username);
            return Err(AnalysisError::QuotaExceeded(entitlement));
        }

        let (lesson, degraded) = self.generate_lesson(&image, grade, &user.username).await;

        let updated = self.policy.consume(user, now);
        self.repo.upsert(&updated).await?;
        let usage = self.policy.evaluate(&updated, now);

        info!(
            "Analysis complete for {} (degraded: {})",
            user.username, degraded
        );
        Ok(AnalysisOutcome {
            lesson,
            usage,
            degraded,
        })
    }

    /// Trial path: the same generation pipeline with no account and no
    /// store mutation. The one-shot gate on the trial token is the
    /// caller's job.
    pub async fn analyze_preview(
        &self,
        image: ImagePayload,
        grade: Option<GradeLevel>,
    ) -> Result<(LessonPlan, bool), AnalysisError> {
        validate_image(&image)?;
        Ok(self.generate_lesson(&image, grade, "trial").await)
    }

    // attempt -> { success | retry (if attempts remain) | fallback }
    async fn generate_lesson(
        &self,
        image: &ImagePayload,
        grade: Option<GradeLevel>,
        username: &str,
    ) -> (LessonPlan, bool) {
        let prompt = build_prompt(grade);

        for attempt in 1..=MAX_LESSON_ATTEMPTS {
            match self.source.generate(&prompt, image).await {
                Ok(text) => match LessonPlan::from_model_text(&text) {
                    Ok(lesson) => {
                        let problems = lesson.validate();
                        if problems.is_empty() {
                            return (lesson, false);
                        }
                        warn!(
                            "Attempt {}/{}: model lesson failed validation: {}",
                            attempt,
                            MAX_LESSON_ATTEMPTS,
                            problems.join(", ")
                        );
                    }
                    Err(e) => warn!(
                        "Attempt {}/{}: model reply was not lesson JSON: {}",
                        attempt, MAX_LESSON_ATTEMPTS, e
                    ),
                },
                Err(e) => warn!(
                    "Attempt {}/{}: collaborator call failed: {}",
                    attempt, MAX_LESSON_ATTEMPTS, e
                ),
            }
        }

        warn!(
            "Serving fallback lesson for {} after {} failed attempts",
            username, MAX_LESSON_ATTEMPTS
        );
        (fallback_lesson(), true)
    }
}

fn validate_image(image: &ImagePayload) -> Result<(), AnalysisError> {
    if image.bytes.is_empty() {
        return Err(AnalysisError::InvalidInput(
            "uploaded file is empty".to_string(),
        ));
    }
    if !image.mime_type.starts_with("image/") {
        return Err(AnalysisError::InvalidInput(format!(
            "expected an image upload, got {}",
            image.mime_type
        )));
    }
    Ok(())
}

fn build_prompt(grade: Option<GradeLevel>) -> String {
    let audience = match grade {
        Some(level) => format!("The child is in grades {}.", level),
        None => {
            "Grade level unknown; use plain language a ten-year-old could follow.".to_string()
        }
    };

    format!(
        "You are a Socratic tutor helping a parent coach their child through the \
         homework problem in the attached photo. Never reveal or compute the final \
         answer to the child's actual problem, in any field. {audience} Reply with a \
         single JSON object and nothing else, with exactly these fields: \
         \"subject\" (string, the subject and topic, e.g. \"Math - Fractions\"); \
         \"questions\" (object with \"foundation\", \"bridge\" and \"mastery\": three \
         guided questions that build from recalling the underlying concept, to \
         connecting it to this problem, to handling this problem type alone); \
         \"behavioral_tip\" (string, one sentence of coaching advice for the parent); \
         \"solution_steps\" (optional array of strings for the parent's eyes only, \
         describing the method without the final answer); \
         \"example_approach\" (optional string walking the same method through a \
         similar problem with different numbers)."
    )
}

/// Served when the collaborator is unavailable or keeps producing
/// invalid output. Generic on purpose.
pub fn fallback_lesson() -> LessonPlan {
    LessonPlan {
        subject: "General problem solving".to_string(),
        questions: QuestionLadder {
            foundation: "Can you read the problem out loud and tell me what it is asking for?"
                .to_string(),
            bridge: "What do we already know from the problem, and what is still missing?"
                .to_string(),
            mastery: "Which step would you try first, and how will you check it worked?"
                .to_string(),
        },
        behavioral_tip:
            "Give your child time to think after each question; silence is part of learning."
                .to_string(),
        solution_steps: None,
        example_approach: None,
    }
}

/// One-shot gate for unauthenticated preview analyses. Tokens are
/// client-generated; a token that has been seen once is spent. Kept in
/// memory only; a restart re-arms trials.
pub struct TrialRegistry {
    used: Mutex<HashSet<String>>,
}

impl TrialRegistry {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    /// True exactly once per token. Tokens shorter than 8 characters
    /// are rejected outright.
    pub async fn try_consume(&self, token: &str) -> bool {
        let token = token.trim();
        if token.len() < 8 {
            return false;
        }
        self.used.lock().await.insert(token.to_string())
    }
}

impl Default for TrialRegistry {
    fn default() -> Self {
        Self::new()
    }
}
