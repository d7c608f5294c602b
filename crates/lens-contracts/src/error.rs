use thiserror::Error;

/// Recoverable failures of a single chat action.
///
/// Each variant aborts only the action that raised it; the session keeps its
/// last valid state (a user turn appended before an upstream failure stays).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("unsupported image format for '{name}': {detail}")]
    UnsupportedFormat { name: String, detail: String },
    #[error("question is empty")]
    EmptyQuestion,
    #[error("no image uploaded; upload an image before asking")]
    MissingImage,
    #[error("{provider} request failed: {message}")]
    UpstreamFailure { provider: String, message: String },
}

impl AnalyzeError {
    pub fn unsupported(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Stable identifier used in `events.jsonl`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::EmptyQuestion => "empty_question",
            Self::MissingImage => "missing_image",
            Self::UpstreamFailure { .. } => "upstream_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AnalyzeError;

    #[test]
    fn kinds_are_stable_snake_case() {
        assert_eq!(
            AnalyzeError::unsupported("a.txt", "no signature").kind(),
            "unsupported_format"
        );
        assert_eq!(AnalyzeError::EmptyQuestion.kind(), "empty_question");
        assert_eq!(AnalyzeError::MissingImage.kind(), "missing_image");
        assert_eq!(
            AnalyzeError::UpstreamFailure {
                provider: "anthropic".to_string(),
                message: "boom".to_string(),
            }
            .kind(),
            "upstream_failure"
        );
    }

    #[test]
    fn upstream_failure_message_names_provider() {
        let err = AnalyzeError::UpstreamFailure {
            provider: "anthropic".to_string(),
            message: "request failed (529): overloaded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "anthropic request failed: request failed (529): overloaded"
        );
    }
}
