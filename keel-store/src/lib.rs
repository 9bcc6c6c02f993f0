//! Storage collaborators for the Keel service host.
//!
//! - [`SessionManager`] opens one dedicated database connection per scoped
//!   use and guarantees it is closed afterwards.
//! - [`BlobStore`] saves and loads objects by logical path.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod blob;
pub mod connector;
pub mod error;
pub mod local;
pub mod session;

pub use blob::{BlobData, BlobInfo, BlobStore, EnvPrefixResolver, PathResolver};
pub use connector::{Connector, PostgresConnector};
pub use error::{BlobError, DatabaseError};
pub use local::LocalBlobStore;
pub use session::{DatabaseSession, SessionManager};
