pub mod atlas;
pub mod config;
pub mod error;
pub mod exchange;
pub mod geometry;
pub mod harness;
pub mod loop_closing;
pub mod matching;
pub mod optimizer;
pub mod system;
pub mod vocabulary;

pub use config::LoopClosingConfig;
pub use error::{LoopClosingError, Result};
