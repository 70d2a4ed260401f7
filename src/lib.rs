//! Socratic Parent
//!
//! Homework photo analysis that coaches parents with guided questions, never answers.
//!
//! ## Standalone
//!
//! Run the binary:
//! ```bash
//! socratic-parent-server
//! ```
//!
//! ## Embedded (Axum)
//!
//! When the `server` feature is enabled, this crate can be embedded into a larger Axum app:
//! ```rust,ignore
//! use axum::Router;
//! use socratic_parent::infrastructure::{AppConfig, JsonFileUserStore};
//! use socratic_parent::server::{build_state_with_store, router};
//! use std::sync::Arc;
//!
//! let cfg = AppConfig::from_env()?;
//! let users = Arc::new(JsonFileUserStore::open(cfg.store_path.clone()).await?);
//! let state = build_state_with_store(cfg, users).await?;
//! let app = Router::new().nest("/socratic", router(state));
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

// Standalone + embedded HTTP server support (Axum).
// Enabled behind the `server` feature so the core library can be used without Axum.
#[cfg(feature = "server")]
pub mod server;

pub use application::*;
pub use domain::*;
pub use infrastructure::*;

#[cfg(feature = "server")]
pub use server::*;
