//! attend-store: SQLite persistence for the gallery and the attendance log.
//!
//! [`SqliteStore`] is the synchronous writer owned by the recognition
//! engine; [`StoreReader`] serves async read-only queries.

pub mod queries;
pub mod reader;
pub mod schema;
mod store;

pub use queries::{CameraRecord, IdentityRecord, LogFilter, LogRecord};
pub use reader::{ReadError, StoreReader};
pub use store::SqliteStore;
