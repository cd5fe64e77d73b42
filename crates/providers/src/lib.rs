//! LLM Provider implementations for SnapClaw.
//!
//! All providers implement the `snapclaw_core::Provider` trait. Any
//! OpenAI-compatible endpoint (OpenRouter, OpenAI, Ollama, vLLM) goes
//! through [`OpenAiCompatProvider`].

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
