//! Core types for the Keel service host.
//!
//! Holds the environment-backed configuration, the coercion helpers it is
//! resolved with, and the authorization predicates the request pipeline
//! evaluates.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod auth;
pub mod coerce;
pub mod config;
pub mod error;

pub use auth::{
    basic_auth, bearer, prefixed_token, AuthError, AuthOutcome, Authorizer, Credentials,
    DecodeFailure, RequestMeta,
};
pub use config::{DatabaseOptions, HostEnv, DEFAULT_DEPLOY_ENV, DEFAULT_PORT};
pub use error::CoreError;
