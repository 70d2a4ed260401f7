pub mod auth;
pub mod config;
pub mod gemini;
pub mod repository;

pub use auth::*;
pub use config::*;
pub use gemini::*;
pub use repository::*;
