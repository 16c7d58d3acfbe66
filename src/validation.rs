//! Input validation: task content guardrails and A2A structured payloads.
//! Payloads are strictly validated; ones that fail degrade gracefully to
//! free-text rather than erroring the turn.

use crate::{FleetError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use validator::Validate;

pub const MAX_TASK_CONTENT_LENGTH: usize = 10_000;
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 1_000;

static SAFE_CONTENT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script", "javascript:", "vbscript:", "data:text/html",
    "&&", "||", ";rm", ";del", "`rm", "$(rm",
    "union select", "drop table", "delete from",
    "../", "..\\", "file://", "/etc/passwd", "/etc/shadow",
];

#[derive(Debug, Clone)]
pub struct ContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl ContentValidator {
    pub fn new() -> Result<Self> {
        let safe_content_regex = Regex::new(SAFE_CONTENT_REGEX)
            .map_err(|e| FleetError::validation(format!("invalid content regex: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();
        Ok(ContentValidator { safe_content_regex, dangerous_patterns })
    }

    pub fn validate_task_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(FleetError::validation("task content cannot be empty"));
        }
        if content.len() > MAX_TASK_CONTENT_LENGTH {
            return Err(FleetError::validation(format!(
                "task content exceeds {MAX_TASK_CONTENT_LENGTH} characters"
            )));
        }
        self.check_dangerous(content)?;
        if !self.safe_content_regex.is_match(content) {
            return Err(FleetError::validation("task content contains invalid characters"));
        }
        Ok(())
    }

    pub fn validate_context_value(&self, value: &str) -> Result<()> {
        if value.len() > MAX_CONTEXT_VALUE_LENGTH {
            return Err(FleetError::validation(format!(
                "context value exceeds {MAX_CONTEXT_VALUE_LENGTH} characters"
            )));
        }
        self.check_dangerous(value)
    }

    fn check_dangerous(&self, content: &str) -> Result<()> {
        let lower = content.to_lowercase();
        if self.dangerous_patterns.iter().any(|p| lower.contains(p.as_str())) {
            return Err(FleetError::validation("content contains a disallowed pattern"));
        }
        Ok(())
    }
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new().expect("static regex is always valid")
    }
}

/// One of the four structured A2A payload kinds. A message that fails to
/// deserialize into any of these degrades to free-text rather than erroring
/// the whole turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum A2aPayload {
    TaskDelegation(TaskDelegationPayload),
    StatusReport(StatusReportPayload),
    Question(QuestionPayload),
    Answer(AnswerPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TaskDelegationPayload {
    #[validate(length(min = 1, max = 10000))]
    pub task: String,
    pub label: Option<String>,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StatusReportPayload {
    #[validate(length(min = 1, max = 2000))]
    pub summary: String,
    pub progress_pct: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuestionPayload {
    #[validate(length(min = 1, max = 4000))]
    pub text: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnswerPayload {
    #[validate(length(min = 1, max = 4000))]
    pub text: String,
    pub conversation_id: String,
}

/// Attempts to parse `raw` as one of the four payload kinds and validate it.
/// Returns `None` (meaning: treat as free text) on any parse or validation
/// failure, matching the "degrade gracefully" contract.
pub fn parse_structured_payload(raw: &serde_json::Value) -> Option<A2aPayload> {
    let payload: A2aPayload = serde_json::from_value(raw.clone()).ok()?;
    let valid = match &payload {
        A2aPayload::TaskDelegation(p) => p.validate().is_ok(),
        A2aPayload::StatusReport(p) => p.validate().is_ok(),
        A2aPayload::Question(p) => p.validate().is_ok(),
        A2aPayload::Answer(p) => p.validate().is_ok(),
    };
    valid.then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_plain_content() {
        let v = ContentValidator::new().unwrap();
        assert!(v.validate_task_content("Create a hello world function").is_ok());
    }

    #[test]
    fn rejects_script_injection() {
        let v = ContentValidator::new().unwrap();
        assert!(v.validate_task_content("<script>alert(1)</script>").is_err());
    }

    #[test]
    fn rejects_command_injection() {
        let v = ContentValidator::new().unwrap();
        assert!(v.validate_task_content("build it && rm -rf /").is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_content() {
        let v = ContentValidator::new().unwrap();
        assert!(v.validate_task_content("").is_err());
        assert!(v.validate_task_content(&"x".repeat(MAX_TASK_CONTENT_LENGTH + 1)).is_err());
    }

    #[test]
    fn parses_valid_task_delegation_payload() {
        let raw = json!({"kind": "task_delegation", "task": "write tests", "label": null, "max_retries": 2});
        let parsed = parse_structured_payload(&raw);
        assert!(matches!(parsed, Some(A2aPayload::TaskDelegation(_))));
    }

    #[test]
    fn invalid_payload_degrades_to_free_text() {
        let raw = json!({"kind": "task_delegation", "task": "", "max_retries": 2});
        assert!(parse_structured_payload(&raw).is_none());

        let raw = json!({"not": "a recognized shape"});
        assert!(parse_structured_payload(&raw).is_none());
    }
}
