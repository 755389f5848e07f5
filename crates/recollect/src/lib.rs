//! Recollect - ingestion, retrieval and decryption core for encrypted personal memories
//!
//! This crate provides a daemon and library that batch memories through an
//! embedding → indexing → storage pipeline, answer fused multi-strategy
//! searches over them, and decrypt results through pooled per-user session
//! keys.

pub mod admin;
pub mod batch;
pub mod cache;
pub mod collab;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod pipeline;
pub mod retrieval;
pub mod retry;
pub mod server;
pub mod testing;

pub use error::{ErrorKind, RecollectError, Result};
