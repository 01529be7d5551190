//! Errors raised while loading and validating configuration

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_problem() {
        let err = Error::Config("no upstream API keys configured".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: no upstream API keys configured"
        );
    }

    #[test]
    fn io_error_converts_via_question_mark() {
        fn read_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/rotating-chat-proxy.toml")?)
        }

        let err = read_missing().unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got: {err:?}");
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }

    #[test]
    fn toml_error_converts_from_parse_failure() {
        let parsed: std::result::Result<toml::Table, _> = toml::from_str("[proxy\nbroken");
        let err: Error = parsed.unwrap_err().into();
        assert!(
            format!("{err:?}").contains("Toml"),
            "Debug should include variant name, got: {err:?}"
        );
    }
}
