//! sharemesh core library
//!
//! This crate provides the record schema, validation, and ingress
//! authentication for the sharemesh content-sharing mesh.
//!
//! # Modules
//!
//! - [`types`]: `SharedRecord` and its nested schema
//! - [`validate`]: Pure field-level validation with freshness windows
//! - [`auth`]: ECDSA P-256 signature authentication of submitted bodies
//! - [`error`]: Error types

pub mod auth;
pub mod error;
pub mod types;
pub mod validate;

pub use auth::{authenticate, PublicKey};
pub use error::{Error, Result};
pub use types::*;
pub use validate::{validate, ValidateOptions};
