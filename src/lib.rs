// ABOUTME: Library root for convoy — re-exports all modules for integration testing.
// ABOUTME: The binary entry point is in main.rs, which uses this crate as a library.

pub mod app;
pub mod config;
pub mod error;
pub mod export;
pub mod gateway;
pub mod session;

pub use error::{PersistenceError, SessionError};
pub use gateway::PersistenceGateway;
pub use session::{SessionStore, StoreOptions};
