//! sx-core: Core types and traits for swarmx
//!
//! This crate provides the error taxonomy, chat message types, the
//! `Provider` trait and the two-message `ChatClient` used by the
//! orchestration loop.

pub mod client;
pub mod error;
pub mod message;
pub mod provider;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ChatClient, ChatOptions, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
pub use error::{Error, PushFailureKind};
pub use message::{Message, Role, Usage};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};

pub type Result<T> = std::result::Result<T, Error>;
