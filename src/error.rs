use std::fmt::{self, Debug, Display};
use std::io;

/// Provides `StageflowError` and maps other errors to it.
///
/// The variants follow the three failure classes of a run: configuration problems found while
/// the compartment graph is assembled, numeric problems found while it is iterated, and failures
/// of the formula evaluator.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum StageflowError {
    IoError(io::Error),
    JsonError(serde_json::Error),
    CsvError(csv::Error),
    /// The compartment graph or its input is malformed. The run must not start.
    ConfigError(String),
    /// A modeling violation found while iterating, raised only in strict mode.
    NumericError(String),
    /// A formula could not be evaluated.
    EvaluationError(String),
    /// A distribution was given invalid parameters.
    DistributionError(String),
    StageflowError(String),
}

impl From<io::Error> for StageflowError {
    fn from(error: io::Error) -> Self {
        StageflowError::IoError(error)
    }
}

impl From<serde_json::Error> for StageflowError {
    fn from(error: serde_json::Error) -> Self {
        StageflowError::JsonError(error)
    }
}

impl From<csv::Error> for StageflowError {
    fn from(error: csv::Error) -> Self {
        StageflowError::CsvError(error)
    }
}

impl From<evalexpr::EvalexprError> for StageflowError {
    fn from(error: evalexpr::EvalexprError) -> Self {
        StageflowError::EvaluationError(error.to_string())
    }
}

impl From<String> for StageflowError {
    fn from(error: String) -> Self {
        StageflowError::StageflowError(error)
    }
}

impl From<&str> for StageflowError {
    fn from(error: &str) -> Self {
        StageflowError::StageflowError(error.to_string())
    }
}

impl std::error::Error for StageflowError {}

impl Display for StageflowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StageflowError::ConfigError(message) => write!(f, "Configuration error: {message}"),
            StageflowError::NumericError(message) => write!(f, "Numeric error: {message}"),
            StageflowError::EvaluationError(message) => write!(f, "Evaluation error: {message}"),
            StageflowError::DistributionError(message) => {
                write!(f, "Distribution error: {message}")
            }
            _ => write!(f, "Error: {self:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_from_strings() {
        let error: StageflowError = "boom".into();
        assert!(matches!(error, StageflowError::StageflowError(ref m) if m == "boom"));
        let error: StageflowError = String::from("bang").into();
        assert!(matches!(error, StageflowError::StageflowError(ref m) if m == "bang"));
    }

    #[test]
    fn displays_category() {
        let error = StageflowError::ConfigError("duplicate edge".to_string());
        assert_eq!(error.to_string(), "Configuration error: duplicate edge");
        let error = StageflowError::EvaluationError("unknown name".to_string());
        assert_eq!(error.to_string(), "Evaluation error: unknown name");
    }

    #[test]
    fn converts_io_errors() {
        let error: StageflowError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(error, StageflowError::IoError(_)));
    }
}
