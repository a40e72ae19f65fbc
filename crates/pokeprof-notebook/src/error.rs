use notebook_common::error::CommonError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("index store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("oracle call timed out")]
    OracleTimeout,

    #[error("oracle returned id outside the frontier: {0}")]
    OracleContractViolation(String),

    #[error("synthesizer failed: {0}")]
    SynthesizerFailure(String),

    #[error("synthesizer timed out")]
    SynthesizerTimeout,

    #[error("retrieval exhausted: neither the oracle nor keyword fallback produced a section")]
    RetrievalExhausted,
}

impl AppError {
    /// Message suitable for showing to an end user in a terminal `error` event.
    pub fn user_message(&self) -> String {
        match self {
            AppError::RetrievalExhausted => {
                "No relevant sections found. Try rephrasing your question.".to_string()
            }
            AppError::SynthesizerFailure(_) => {
                "The answer service is temporarily unavailable. Please try again.".to_string()
            }
            AppError::SynthesizerTimeout => {
                "The answer took too long to generate. Please try again.".to_string()
            }
            AppError::OracleUnavailable(_) | AppError::OracleTimeout => {
                "The search service is temporarily unavailable. Please try again.".to_string()
            }
            AppError::NotFound { kind, name } => format!("{kind} not found: {name}"),
            AppError::Parse { .. } | AppError::Store(_) | AppError::Config(_) => {
                "Server configuration error.".to_string()
            }
            AppError::Common(_) | AppError::Io(_) | AppError::OracleContractViolation(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_hide_internal_detail() {
        let err = AppError::SynthesizerFailure("status=500 body=<html>".to_string());
        assert!(!err.user_message().contains("500"));
        let err = AppError::Store("/var/lib/pokeprof/rulebook.json: EOF".to_string());
        assert!(!err.user_message().contains("/var/lib"));
    }

    #[test]
    fn not_found_names_the_missing_thing() {
        let err = AppError::NotFound {
            kind: "index",
            name: "rulebook".to_string(),
        };
        assert_eq!(err.user_message(), "index not found: rulebook");
        assert_eq!(err.to_string(), "index not found: rulebook");
    }
}
