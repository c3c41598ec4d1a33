// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur during training or evaluation
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Invalid or conflicting command line configuration
    Config(String),

    /// Malformed input data (bad header, row arity mismatch, unparseable cell)
    InputParse(String),

    /// A raw feature value does not fit any of the supported column types
    TypePromotion(String),

    /// A feature with no observations cannot be bucketized
    Bucketize(String),

    /// A pipeline was closed by its consumer
    QueueAborted,

    /// The ensemble file could not be deserialized
    CorruptEnsemble(String),

    /// Training reached a state that is not supposed to happen
    Train(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::InputParse(msg) => write!(f, "cannot parse input data: {msg}"),
            Self::TypePromotion(msg) => write!(f, "cannot promote feature type: {msg}"),
            Self::Bucketize(msg) => write!(f, "cannot bucketize feature: {msg}"),
            Self::QueueAborted => write!(f, "pipeline aborted by consumer"),
            Self::CorruptEnsemble(msg) => write!(f, "corrupt ensemble: {msg}"),
            Self::Train(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::CorruptEnsemble(value.to_string())
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
