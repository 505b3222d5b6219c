pub mod app;
pub mod chat;
pub mod client;
pub mod error;
pub mod settings;

#[cfg(test)]
mod testing;

pub use client::{ChatClient, default_session_name};
pub use error::{ChatError, ChatResult, ErrorKind};
