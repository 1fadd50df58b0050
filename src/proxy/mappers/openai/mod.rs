// OpenAI-compatible shapes and the two response paths

pub mod collector;
pub mod models;
pub mod streaming;
