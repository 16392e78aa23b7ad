//! Error types for the loop-closing engine.

use thiserror::Error;

use crate::atlas::map::KeyFrameId;
use crate::vocabulary::VocabularyError;

#[derive(Error, Debug)]
pub enum LoopClosingError {
    #[error("unknown keyframe {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("keyframe {0} has no BoW vector")]
    MissingBow(KeyFrameId),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(#[from] VocabularyError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loop closing has finished")]
    Finished,
}

impl From<serde_json::Error> for LoopClosingError {
    fn from(e: serde_json::Error) -> Self {
        LoopClosingError::Serialization(e.to_string())
    }
}

impl From<postcard::Error> for LoopClosingError {
    fn from(e: postcard::Error) -> Self {
        LoopClosingError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for LoopClosingError {
    fn from(e: serde_yaml::Error) -> Self {
        LoopClosingError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoopClosingError>;
