//! A [`Host`] with scoped database access.

use std::sync::Arc;

use futures::future::BoxFuture;
use keel_core::DatabaseOptions;
use keel_store::{Connector, DatabaseError, DatabaseSession, SessionManager};

use crate::config::HostConfig;
use crate::host::Host;
use crate::pipeline::RouteRegistrar;

/// Capability to hand out database sessions.
pub trait DatabaseAccess {
    type Connector: Connector;

    fn sessions(&self) -> &SessionManager<Self::Connector>;
}

impl<K: Connector> DatabaseAccess for SessionManager<K> {
    type Connector = K;

    fn sessions(&self) -> &SessionManager<K> {
        self
    }
}

/// A [`Host`] composed with a [`SessionManager`].
///
/// Route handlers get the same session manager through the registrar
/// factory passed to [`DatabaseHost::new`].
pub struct DatabaseHost<K> {
    host: Host,
    sessions: Arc<SessionManager<K>>,
}

impl<K> std::fmt::Debug for DatabaseHost<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHost")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<K: Connector + 'static> DatabaseHost<K> {
    /// Create a host whose sessions default to the environment's database
    /// options.
    ///
    /// `routes` receives the shared session manager and returns the route
    /// registrar for the host.
    pub fn new<R, F>(config: HostConfig, connector: K, routes: F) -> Self
    where
        R: RouteRegistrar + 'static,
        F: FnOnce(Arc<SessionManager<K>>) -> R,
    {
        let defaults = config.env().database.clone();
        let sessions = Arc::new(SessionManager::new(connector, defaults));
        let registrar = routes(Arc::clone(&sessions));
        Self {
            host: Host::new(config, registrar),
            sessions,
        }
    }

    /// The lifecycle manager; use it to initialize, start and stop.
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.host
    }

    #[must_use]
    pub fn session_manager(&self) -> Arc<SessionManager<K>> {
        Arc::clone(&self.sessions)
    }

    /// See [`SessionManager::open_database`].
    ///
    /// # Errors
    /// Returns [`DatabaseError::Connection`] if the connection cannot be
    /// established.
    pub async fn open_database(
        &self,
        options: Option<DatabaseOptions>,
    ) -> Result<DatabaseSession<K::Connection>, DatabaseError> {
        self.sessions.open_database(options).await
    }

    /// See [`SessionManager::close`].
    ///
    /// # Errors
    /// Returns [`DatabaseError::Disconnect`] if closing fails.
    pub async fn close_database(
        &self,
        session: DatabaseSession<K::Connection>,
    ) -> Result<(), DatabaseError> {
        self.sessions.close(session).await
    }

    /// See [`SessionManager::with_database`].
    ///
    /// # Errors
    /// Returns the open error, the action's error or the close error.
    pub async fn with_database<T, E, F>(&self, options: Option<DatabaseOptions>, action: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut DatabaseSession<K::Connection>) -> BoxFuture<'s, Result<T, E>>,
        E: From<DatabaseError>,
    {
        self.sessions.with_database(options, action).await
    }
}

impl<K: Connector> DatabaseAccess for DatabaseHost<K> {
    type Connector = K;

    fn sessions(&self) -> &SessionManager<K> {
        &self.sessions
    }
}
