//! `ledgerdesk-core` — shared domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the domain error model used across the
//! platform.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
