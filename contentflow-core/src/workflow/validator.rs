//! Request validation for new workflow sessions

use crate::error::WorkflowError;

/// Longest prompt accepted, in characters
pub const MAX_PROMPT_CHARS: usize = 8_000;

/// Longest user id accepted, in characters
pub const MAX_USER_ID_CHARS: usize = 128;

/// Validation error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Collapse into `InvalidInput` listing every problem
    pub fn into_result(self) -> Result<(), WorkflowError> {
        if self.is_valid() {
            return Ok(());
        }
        let messages: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        Err(WorkflowError::InvalidInput(messages.join("; ")))
    }
}

/// Validator for start requests
pub struct RequestValidator;

impl RequestValidator {
    /// Prompt must contain visible text, stay under the length cap and carry
    /// no control characters other than whitespace
    pub fn validate_prompt(prompt: &str, result: &mut ValidationResult) {
        if prompt.trim().is_empty() {
            result.add_error("prompt", "prompt must not be empty");
            return;
        }

        let chars = prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            result.add_error(
                "prompt",
                format!(
                    "prompt is {} characters, limit is {}",
                    chars, MAX_PROMPT_CHARS
                ),
            );
        }

        if prompt
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            result.add_error("prompt", "prompt contains control characters");
        }
    }

    pub fn validate_user_id(user_id: &str, result: &mut ValidationResult) {
        if user_id.trim().is_empty() {
            result.add_error("user_id", "user id must not be empty");
            return;
        }
        if user_id.chars().count() > MAX_USER_ID_CHARS {
            result.add_error(
                "user_id",
                format!("user id cannot exceed {} characters", MAX_USER_ID_CHARS),
            );
        }
        if user_id.chars().any(char::is_control) {
            result.add_error("user_id", "user id contains control characters");
        }
    }

    /// Validate a start request before anything is created
    pub fn validate_start(prompt: &str, user_id: &str) -> Result<(), WorkflowError> {
        let mut result = ValidationResult::new();
        Self::validate_user_id(user_id, &mut result);
        Self::validate_prompt(prompt, &mut result);
        result.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_start_request() {
        assert!(RequestValidator::validate_start("Write a launch post\nfor spring", "user-1").is_ok());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        for prompt in ["", "   ", "\n\t"] {
            let err = RequestValidator::validate_start(prompt, "user-1").unwrap_err();
            assert_eq!(err.code(), "invalid_input");
        }
    }

    #[test]
    fn test_oversized_prompt_rejected() {
        let prompt = "a".repeat(MAX_PROMPT_CHARS + 1);
        let mut result = ValidationResult::new();
        RequestValidator::validate_prompt(&prompt, &mut result);

        assert!(!result.is_valid());
        assert_eq!(result.errors[0].field, "prompt");
    }

    #[test]
    fn test_control_characters_rejected() {
        let err = RequestValidator::validate_start("hello\u{0007}world", "user-1").unwrap_err();
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn test_errors_are_combined() {
        let err = RequestValidator::validate_start("", "").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("user_id"));
        assert!(message.contains("prompt"));
    }
}
