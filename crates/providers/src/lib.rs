//! Chat-completion providers for codeloop.
//!
//! All providers implement the `codeloop_core::Provider` trait. The agent
//! loop only ever sees `Arc<dyn Provider>`, so hosts can plug in their own.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
