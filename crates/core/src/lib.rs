//! `collectq-core`: identifiers and domain primitives shared by the queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
