pub mod attachments;
pub mod chat_stream;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod error;
pub mod message;
pub mod providers;
pub mod registry;
pub mod session;
pub mod tools;
