//! Environment-backed host configuration.
//!
//! The process environment is read exactly once, by [`HostEnv::from_env`].
//! Everything downstream consumes the resulting immutable value.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::coerce::{non_empty, to_number};
use crate::CoreError;

/// Port used when neither the caller nor the environment supplies one.
pub const DEFAULT_PORT: u16 = 80;

/// Deployment tag used when `DEPLOY_ENV` is unset.
pub const DEFAULT_DEPLOY_ENV: &str = "prod";

const DEVELOPMENT_TAGS: [&str; 3] = ["local", "dev", "development"];

/// Connection parameters for the backing document database.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DatabaseOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    /// Driver-specific extra options, passed through verbatim.
    pub options: BTreeMap<String, String>,
}

impl DatabaseOptions {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: None,
            password: None,
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self::new("localhost", 5432, "keel")
    }
}

impl PartialEq for DatabaseOptions {
    fn eq(&self, other: &Self) -> bool {
        let password = |o: &Self| o.password.as_ref().map(|p| p.expose_secret().to_owned());
        self.host == other.host
            && self.port == other.port
            && self.database == other.database
            && self.user == other.user
            && password(self) == password(other)
            && self.options == other.options
    }
}

impl Eq for DatabaseOptions {}

/// Host settings resolved from the environment.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HostEnv {
    /// Listener port from `PORT`, if set.
    pub port: Option<u16>,
    /// Listener address from `KEEL_BIND_ADDR`.
    pub bind_addr: IpAddr,
    /// Deployment tag from `DEPLOY_ENV`, lowercased.
    pub deploy_env: String,
    /// Default database parameters for sessions opened without options.
    pub database: DatabaseOptions,
    /// Object-store container from `BLOB_CONTAINER`.
    pub blob_container: String,
    /// Local blob root from `BLOB_ROOT`.
    pub blob_root: PathBuf,
    /// Identity header value from `KEEL_IDENTITY`.
    pub identity: String,
}

impl HostEnv {
    /// Resolve configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidValue`] when a numeric or structured
    /// variable is present but malformed.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary lookup function.
    ///
    /// # Errors
    /// Same as [`HostEnv::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key).as_deref());
        let defaults = Self::default();

        let port = get("PORT")
            .map(|v| to_number::<u16>("PORT", &v))
            .transpose()?;
        let bind_addr = get("KEEL_BIND_ADDR")
            .map(|v| to_number::<IpAddr>("KEEL_BIND_ADDR", &v))
            .transpose()?
            .unwrap_or(defaults.bind_addr);

        let mut database = DatabaseOptions::default();
        if let Some(host) = get("DB_HOST") {
            database.host = host;
        }
        if let Some(port) = get("DB_PORT") {
            database.port = to_number("DB_PORT", &port)?;
        }
        if let Some(name) = get("DB_NAME") {
            database.database = name;
        }
        database.user = get("DB_USER");
        // Credentials are taken verbatim; surrounding whitespace is significant.
        database.password = lookup("DB_PASSWORD")
            .filter(|v| !v.is_empty())
            .map(SecretString::from);
        if let Some(raw) = get("DB_OPTIONS") {
            database.options = parse_options("DB_OPTIONS", &raw)?;
        }

        Ok(Self {
            port,
            bind_addr,
            deploy_env: get("DEPLOY_ENV")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.deploy_env),
            database,
            blob_container: get("BLOB_CONTAINER").unwrap_or(defaults.blob_container),
            blob_root: get("BLOB_ROOT").map_or(defaults.blob_root, PathBuf::from),
            identity: get("KEEL_IDENTITY").unwrap_or(defaults.identity),
        })
    }

    /// `true` when the deployment tag marks a local development build.
    #[must_use]
    pub fn is_development(&self) -> bool {
        DEVELOPMENT_TAGS.contains(&self.deploy_env.as_str())
    }

    /// Port precedence: explicit argument, then `PORT`, then [`DEFAULT_PORT`].
    #[must_use]
    pub fn resolve_port(&self, explicit: Option<u16>) -> u16 {
        explicit.or(self.port).unwrap_or(DEFAULT_PORT)
    }
}

impl Default for HostEnv {
    fn default() -> Self {
        Self {
            port: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            deploy_env: DEFAULT_DEPLOY_ENV.to_owned(),
            database: DatabaseOptions::default(),
            blob_container: "keel".to_owned(),
            blob_root: PathBuf::from("./blobs"),
            identity: "keel".to_owned(),
        }
    }
}

fn parse_options(key: &str, raw: &str) -> Result<BTreeMap<String, String>, CoreError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.into_iter().collect())
        .map_err(|e| CoreError::invalid(key, raw, e))
}
