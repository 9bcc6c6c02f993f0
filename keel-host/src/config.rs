//! Host configuration: which optional pipeline stages run and how.

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderName;
use keel_core::{Authorizer, HostEnv};

/// Path prefix every pipeline route is mounted under.
pub const API_PREFIX: &str = "/api";

/// Response header carrying the identity string.
pub const IDENTITY_HEADER: HeaderName = HeaderName::from_static("x-powered-by");

/// Default body size limit: 100 KiB.
pub const DEFAULT_BODY_LIMIT: usize = 100 * 1024;

/// Effective body parser settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyParserOptions {
    /// Maximum body size in bytes, after inflation.
    pub limit: usize,
    /// Only accept JSON objects and arrays at the top level.
    pub strict: bool,
    /// Inflate `gzip` and `deflate` encoded bodies.
    pub inflate: bool,
    /// Charset assumed when `Content-Type` names none.
    pub default_charset: String,
}

impl Default for BodyParserOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_BODY_LIMIT,
            strict: true,
            inflate: true,
            default_charset: "utf-8".to_owned(),
        }
    }
}

impl BodyParserOptions {
    /// Defaults with every set field of `overrides` applied on top.
    #[must_use]
    pub fn merged(overrides: &BodyParserOverrides) -> Self {
        let defaults = Self::default();
        Self {
            limit: overrides.limit.unwrap_or(defaults.limit),
            strict: overrides.strict.unwrap_or(defaults.strict),
            inflate: overrides.inflate.unwrap_or(defaults.inflate),
            default_charset: overrides
                .default_charset
                .clone()
                .unwrap_or(defaults.default_charset),
        }
    }
}

/// Partial body parser settings merged over [`BodyParserOptions::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyParserOverrides {
    pub limit: Option<usize>,
    pub strict: Option<bool>,
    pub inflate: Option<bool>,
    pub default_charset: Option<String>,
}

/// Body parsing stage setting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BodyParsing {
    Disabled,
    #[default]
    Defaults,
    Overrides(BodyParserOverrides),
}

impl BodyParsing {
    /// Effective options, or `None` when disabled.
    #[must_use]
    pub fn options(&self) -> Option<BodyParserOptions> {
        match self {
            Self::Disabled => None,
            Self::Defaults => Some(BodyParserOptions::default()),
            Self::Overrides(overrides) => Some(BodyParserOptions::merged(overrides)),
        }
    }
}

/// Receives formatted route failure reports.
pub type ErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Error handling stage setting.
#[derive(Clone, Default)]
pub enum ErrorHandling {
    Disabled,
    /// Report to the `tracing` error log.
    #[default]
    Enabled,
    /// Report to a custom sink.
    WithSink(ErrorSink),
}

impl ErrorHandling {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::WithSink(_) => f.write_str("WithSink(..)"),
        }
    }
}

/// Mutable configuration owned by one host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    env: HostEnv,
    authorizer: Option<Authorizer>,
    identity_header: HeaderName,
    identity: String,
    body_parsing: BodyParsing,
    error_handling: ErrorHandling,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            env: HostEnv::default(),
            authorizer: None,
            identity_header: IDENTITY_HEADER,
            identity: String::new(),
            body_parsing: BodyParsing::default(),
            error_handling: ErrorHandling::default(),
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn new(env: HostEnv) -> Self {
        Self { env, ..Self::default() }
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Authorizer) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Use `name` instead of `X-Powered-By` for the identity header.
    #[must_use]
    pub fn with_identity_header(mut self, name: HeaderName) -> Self {
        self.identity_header = name;
        self
    }

    #[must_use]
    pub fn with_body_parsing(mut self, body_parsing: BodyParsing) -> Self {
        self.body_parsing = body_parsing;
        self
    }

    #[must_use]
    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    #[must_use]
    pub fn env(&self) -> &HostEnv {
        &self.env
    }

    #[must_use]
    pub fn authorizer(&self) -> Option<&Authorizer> {
        self.authorizer.as_ref()
    }

    /// Replace the authorization predicate; `None` allows every request.
    pub fn set_authorizer(&mut self, authorizer: Option<Authorizer>) {
        self.authorizer = authorizer;
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn identity_header(&self) -> &HeaderName {
        &self.identity_header
    }

    /// Set the identity header value; an empty string disables the header.
    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = identity.into();
    }

    #[must_use]
    pub fn body_parsing(&self) -> &BodyParsing {
        &self.body_parsing
    }

    pub fn set_body_parsing(&mut self, body_parsing: BodyParsing) {
        self.body_parsing = body_parsing;
    }

    #[must_use]
    pub fn error_handling(&self) -> &ErrorHandling {
        &self.error_handling
    }

    pub fn set_error_handling(&mut self, error_handling: ErrorHandling) {
        self.error_handling = error_handling;
    }
}

/// Settings applied to the configuration by [`crate::Host::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    pub body_parsing: Option<BodyParsing>,
    pub error_handling: Option<ErrorHandling>,
}

impl InitializeOptions {
    pub(crate) fn apply(self, config: &mut HostConfig) {
        if let Some(body_parsing) = self.body_parsing {
            config.set_body_parsing(body_parsing);
        }
        if let Some(error_handling) = self.error_handling {
            config.set_error_handling(error_handling);
        }
    }
}
