pub mod chat;
pub mod client;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod prompts;
pub mod providers;
pub mod relay;
pub mod server;
pub mod sse;
pub mod transcoder;

// Re-export commonly used types for easier access
pub use config::{Config, load_config};
pub use errors::{AppError, AppResult};
pub use server::{AppState, create_app, start_server};
