//! Database layer for Tether

mod change_repository;
mod connection;
mod entity_repository;
mod migrations;
mod queue_repository;
mod watermark_repository;

pub use change_repository::ChangeLogRepository;
pub use connection::Database;
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
pub use queue_repository::QueueRepository;
pub use watermark_repository::WatermarkRepository;

/// Bind an optional column value, mapping `None` to SQL NULL.
pub(crate) fn opt_value<T: Into<libsql::Value>>(value: Option<T>) -> libsql::Value {
    value.map_or(libsql::Value::Null, Into::into)
}
