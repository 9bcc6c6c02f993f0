//! Scoped database sessions.
//!
//! A [`SessionManager`] opens a fresh connection per call and never pools.
//! [`SessionManager::with_database`] binds acquisition and release together:
//! the session is closed on every exit path of the action, panics included.
//! If the caller drops the future mid-action, the session is closed on a
//! background task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use keel_core::DatabaseOptions;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::{target, Connector};
use crate::DatabaseError;

/// An open connection plus the options it was created with.
///
/// Owned by whoever opened it. Closing consumes the session, so it can be
/// closed at most once.
#[derive(Debug)]
pub struct DatabaseSession<C> {
    id: Uuid,
    connection: C,
    options: DatabaseOptions,
}

impl<C> DatabaseSession<C> {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn connection(&mut self) -> &mut C {
        &mut self.connection
    }
}

/// Opens and closes [`DatabaseSession`]s through a [`Connector`].
#[derive(Debug)]
pub struct SessionManager<K> {
    connector: Arc<K>,
    defaults: DatabaseOptions,
}

impl<K: Connector> SessionManager<K> {
    /// Create a manager that falls back to `defaults` when no options are given.
    #[must_use]
    pub fn new(connector: K, defaults: DatabaseOptions) -> Self {
        Self {
            connector: Arc::new(connector),
            defaults,
        }
    }

    #[must_use]
    pub fn defaults(&self) -> &DatabaseOptions {
        &self.defaults
    }

    #[must_use]
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Open a session and wait for it to become ready.
    ///
    /// A connection that opens but fails readiness is disconnected before
    /// the error is returned.
    ///
    /// # Errors
    /// Returns [`DatabaseError::Connection`] if connecting or the readiness
    /// check fails.
    pub async fn open_database(
        &self,
        options: Option<DatabaseOptions>,
    ) -> Result<DatabaseSession<K::Connection>, DatabaseError> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let mut connection = self.connector.connect(&options).await?;

        if let Err(e) = self.connector.ping(&options, &mut connection).await {
            if let Err(close) = self.connector.disconnect(&options, connection).await {
                warn!(db = %target(&options), error = %close, "disconnect after failed readiness check failed");
            }
            return Err(e);
        }

        let session = DatabaseSession {
            id: Uuid::new_v4(),
            connection,
            options,
        };
        info!(session = %session.id, db = %target(&session.options), "database session opened");
        Ok(session)
    }

    /// Close `session`.
    ///
    /// # Errors
    /// Returns [`DatabaseError::Disconnect`] if the connector fails to close.
    pub async fn close(&self, session: DatabaseSession<K::Connection>) -> Result<(), DatabaseError> {
        let DatabaseSession { id, connection, options } = session;
        self.connector.disconnect(&options, connection).await?;
        debug!(session = %id, "database session closed");
        Ok(())
    }

    /// Run `action` with a freshly opened session, then close it.
    ///
    /// The session is closed whether `action` returns `Ok`, returns `Err` or
    /// panics; a panic resumes after the close. If this future is dropped
    /// before `action` finishes (a timeout, a disconnected client), the
    /// session is closed on a background task instead. A close failure is returned
    /// only when `action` succeeded, otherwise it is logged and the action's
    /// outcome wins.
    ///
    /// # Errors
    /// Returns the open error, the action's error, or the close error, in
    /// that order of precedence.
    pub async fn with_database<T, E, F>(
        &self,
        options: Option<DatabaseOptions>,
        action: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut DatabaseSession<K::Connection>) -> BoxFuture<'s, Result<T, E>>,
        E: From<DatabaseError>,
        K: 'static,
    {
        let opened = self.open_database(options).await?;
        let session_id = opened.id;

        let mut guard = SessionGuard {
            connector: Arc::clone(&self.connector),
            session: None,
        };
        let session = guard.session.insert(opened);
        let outcome = AssertUnwindSafe(action(session)).catch_unwind().await;
        let closed = match guard.session.take() {
            Some(session) => self.close(session).await,
            None => Ok(()),
        };

        match (outcome, closed) {
            (Ok(Ok(value)), Ok(())) => Ok(value),
            (Ok(Ok(_)), Err(close)) => Err(close.into()),
            (Ok(Err(e)), closed) => {
                if let Err(close) = closed {
                    warn!(session = %session_id, error = %close, "session close failed after action error");
                }
                Err(e)
            }
            (Err(panic), closed) => {
                if let Err(close) = closed {
                    warn!(session = %session_id, error = %close, "session close failed after action panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Holds a session while a scoped action runs.
///
/// Dropped with the session still inside means the action was abandoned;
/// the connection is then closed on the current runtime.
struct SessionGuard<K: Connector + 'static> {
    connector: Arc<K>,
    session: Option<DatabaseSession<K::Connection>>,
}

impl<K: Connector + 'static> Drop for SessionGuard<K> {
    fn drop(&mut self) {
        let Some(DatabaseSession { id, connection, options }) = self.session.take() else {
            return;
        };
        warn!(session = %id, db = %target(&options), "scoped action abandoned, closing session in background");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = %id, "no runtime available, abandoned session dropped unclosed");
            return;
        };
        let connector = Arc::clone(&self.connector);
        runtime.spawn(async move {
            match connector.disconnect(&options, connection).await {
                Ok(()) => debug!(session = %id, "abandoned database session closed"),
                Err(e) => warn!(session = %id, error = %e, "closing abandoned session failed"),
            }
        });
    }
}
