//! # eoslink-core
//!
//! Shared primitives for the eoslink orchestration bridge:
//!
//! - **Strongly-typed IDs**: ULID-backed identifiers for runs and
//!   dispatch events
//! - **Error type**: the base error enum shared across crates
//! - **Observability**: structured logging initialization

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{EventId, RunId};
