//! State shared between the mapping front end and loop closing.

pub mod shared_state;

pub use shared_state::{MappingPause, SharedState};
