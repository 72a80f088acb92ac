//! sx-providers: LLM provider implementations for swarmx
//!
//! This crate provides implementations of the Provider trait for
//! OpenAI-compatible chat completion APIs (llama.cpp, LiteLLM, OpenRouter).

pub mod openai;

pub use openai::OpenAIProvider;
