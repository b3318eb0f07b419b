use std::fmt;

#[derive(Debug)]
pub enum TrainsetError {
    ConstructionRejected(String),
    InvariantViolation(String),
    Io { path: String, source: String },
    FeatureMismatch { expected: String, got: String },
}

impl fmt::Display for TrainsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainsetError::ConstructionRejected(msg) => {
                write!(f, "corpus construction rejected: {msg}")
            }
            TrainsetError::InvariantViolation(msg) => {
                write!(f, "invariant violation: {msg}")
            }
            TrainsetError::Io { path, source } => {
                write!(f, "I/O error reading '{path}': {source}")
            }
            TrainsetError::FeatureMismatch { expected, got } => {
                write!(f, "feature metadata mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for TrainsetError {}

pub type Result<T> = std::result::Result<T, TrainsetError>;
