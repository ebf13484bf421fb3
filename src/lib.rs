pub mod address;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod history;
pub mod orchestrator;
pub mod prompt;
pub mod response;
pub mod server;
pub mod stream;
pub mod tools;

pub use error::MirageError;
