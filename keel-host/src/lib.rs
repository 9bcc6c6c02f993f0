//! Configurable HTTP service host.
//!
//! A [`Host`] assembles a request pipeline in a fixed order
//! (body parsing, identity header, authorization, development diagnostics,
//! routes, error handling), owns the listening socket, and rebuilds the
//! pipeline on [`Host::initialize`]. [`DatabaseHost`] adds scoped database
//! sessions on top.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod body;
pub mod config;
pub mod database;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod routes;
pub mod stages;

pub use body::{BodyRejection, ParsedBody};
pub use config::{
    BodyParserOptions, BodyParserOverrides, BodyParsing, ErrorHandling, ErrorSink, HostConfig,
    InitializeOptions, API_PREFIX, DEFAULT_BODY_LIMIT, IDENTITY_HEADER,
};
pub use database::{DatabaseAccess, DatabaseHost};
pub use error::{HostError, RouteError};
pub use host::Host;
pub use pipeline::{Pipeline, PipelineStage, RouteRegistrar, Routes};
