//! Document database connector abstraction.
//!
//! Allows swapping the backing store without changing session handling.

use async_trait::async_trait;
use keel_core::DatabaseOptions;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection as _;

use crate::DatabaseError;

/// Opens and closes connections to the backing store.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Live connection handle handed to session users.
    type Connection: Send + 'static;

    /// Open a new connection.
    ///
    /// # Errors
    /// Returns [`DatabaseError::Connection`] if the store cannot be reached.
    async fn connect(&self, options: &DatabaseOptions) -> Result<Self::Connection, DatabaseError>;

    /// Wait until `connection` can serve requests.
    ///
    /// # Errors
    /// Returns [`DatabaseError::Connection`] if the connection is not usable.
    async fn ping(
        &self,
        options: &DatabaseOptions,
        connection: &mut Self::Connection,
    ) -> Result<(), DatabaseError>;

    /// Close `connection`.
    ///
    /// # Errors
    /// Returns [`DatabaseError::Disconnect`] if the close handshake fails.
    async fn disconnect(
        &self,
        options: &DatabaseOptions,
        connection: Self::Connection,
    ) -> Result<(), DatabaseError>;
}

/// `host:port/database`, used to label errors and log events.
#[must_use]
pub fn target(options: &DatabaseOptions) -> String {
    format!("{}:{}/{}", options.host, options.port, options.database)
}

/// PostgreSQL connector.
///
/// Each call to [`Connector::connect`] opens a dedicated connection; nothing
/// is pooled.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

impl PostgresConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn connect_options(options: &DatabaseOptions) -> PgConnectOptions {
        let mut connect = PgConnectOptions::new()
            .host(&options.host)
            .port(options.port)
            .database(&options.database);
        if let Some(user) = &options.user {
            connect = connect.username(user);
        }
        if let Some(password) = &options.password {
            connect = connect.password(password.expose_secret());
        }
        if !options.options.is_empty() {
            connect = connect.options(options.options.iter());
        }
        connect
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PgConnection;

    async fn connect(&self, options: &DatabaseOptions) -> Result<PgConnection, DatabaseError> {
        PgConnection::connect_with(&Self::connect_options(options))
            .await
            .map_err(|e| DatabaseError::Connection {
                target: target(options),
                reason: e.to_string(),
            })
    }

    async fn ping(
        &self,
        options: &DatabaseOptions,
        connection: &mut PgConnection,
    ) -> Result<(), DatabaseError> {
        connection.ping().await.map_err(|e| DatabaseError::Connection {
            target: target(options),
            reason: format!("not ready: {e}"),
        })
    }

    async fn disconnect(
        &self,
        options: &DatabaseOptions,
        connection: PgConnection,
    ) -> Result<(), DatabaseError> {
        connection.close().await.map_err(|e| DatabaseError::Disconnect {
            target: target(options),
            reason: e.to_string(),
        })
    }
}
