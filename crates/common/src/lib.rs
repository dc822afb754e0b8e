//! Common utilities and shared types for jobretry.
//!
//! This crate provides the pieces every jobretry crate leans on:
//!
//! - **Configuration**: Worker, Redis and logging settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//!
//! # Example
//!
//! ```no_run
//! use jobretry_common::{AppResult, Config};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     println!("Redis at {}", config.redis.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{AppError, AppResult};
