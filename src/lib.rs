//! Galleryd - image registry for generation output folders
//!
//! This library crate exposes the service components for the binary and for
//! integration testing.

pub mod app;
pub mod config;
pub mod hooks;
pub mod ingest;
pub mod server;
pub mod state;
pub mod store;
pub mod thumbnails;
pub mod watch;

pub use app::App;
