//! OpenAI-compatible streaming gateway for the Z.ai chat upstream.
//!
//! The core is a per-request translation state machine that reshapes the
//! upstream's phase-delta SSE dialect into OpenAI chat-completion chunks,
//! wrapped in an admission-controlled request pipeline with retry, backoff
//! and per-request anonymous-token acquisition.

pub mod models;
pub mod proxy;
