//! Shopping-assistant core for the triathlon storefront: assistant backend client,
//! connection diagnostics, chat sessions and the in-process log buffer.

pub mod config;
pub mod diagnostics;
pub mod llm;
pub mod logger;
pub mod session;
