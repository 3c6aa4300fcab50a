//! Persistence layer: the `Database` trait and its libSQL backend.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Booking, BookingStatus, CrmSyncStatus, Database, DeliveryStatus, FollowUp, FollowUpKind,
    FollowUpStatus, MessageDirection, MessageRecord,
};
