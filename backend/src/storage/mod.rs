pub mod db_manager;

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::models::{AuditEvent, Request, RequestStatus, SignedRequestRecord, TransactionRecord};

pub use db_manager::SqliteStore;

pub trait RequestDao: Send + Sync {
    fn insert_request(&self, request: &Request) -> Result<(), StorageError>;

    fn get_request(&self, id: &str) -> Result<Option<Request>, StorageError>;

    fn update_status(&self, id: &str, status: RequestStatus) -> Result<(), StorageError>;

    /// Writes `to` only if the stored status is still `from`. Returns false
    /// when another writer got there first.
    fn compare_and_set_status(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<bool, StorageError>;
}

pub trait PreSignedDao: Send + Sync {
    fn insert_signed(&self, record: &SignedRequestRecord) -> Result<(), StorageError>;

    fn get_by_request_id(&self, request_id: &str) -> Result<Option<SignedRequestRecord>, StorageError>;

    /// Signed records whose owning request is currently in `status`.
    fn get_by_status(&self, status: RequestStatus) -> Result<Vec<SignedRequestRecord>, StorageError>;

    fn get_complete_data(
        &self,
        request_id: &str,
    ) -> Result<Option<(Request, SignedRequestRecord)>, StorageError>;

    fn record_check(
        &self,
        request_id: &str,
        check_count: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

pub trait TransactionDao: Send + Sync {
    fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StorageError>;

    fn get_transaction_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<TransactionRecord>, StorageError>;
}

pub trait AuditDao: Send + Sync {
    fn log_event(&self, event: &AuditEvent) -> Result<(), StorageError>;

    fn events_for_request(&self, request_id: &str) -> Result<Vec<AuditEvent>, StorageError>;

    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError>;
}

/// Everything the services need from the database.
pub trait Persistence: RequestDao + PreSignedDao + TransactionDao + AuditDao {}

impl<T> Persistence for T where T: RequestDao + PreSignedDao + TransactionDao + AuditDao {}
