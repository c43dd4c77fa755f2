use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{AuditDao, PreSignedDao, RequestDao, TransactionDao};
use crate::error::StorageError;
use crate::models::{
    AuditEvent, AuditEventType, Request, RequestStatus, SignedRequestRecord, SubmissionMode,
    TransactionRecord,
};

const SIGNED_COLUMNS: &str = "request_id, transaction_hash, encrypted_tx_body, encrypted_witness_set,
     encryption_metadata, fee_amount, ttl_slot, selected_inputs, wallet_used, signed_at,
     check_count, last_checked_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::InvalidValue(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                recipient TEXT NOT NULL,
                amount_spec TEXT NOT NULL,
                ttl_slot INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pre_signed_transactions (
                request_id TEXT PRIMARY KEY REFERENCES requests(id),
                transaction_hash TEXT NOT NULL,
                encrypted_tx_body TEXT NOT NULL,
                encrypted_witness_set TEXT NOT NULL,
                encryption_metadata TEXT NOT NULL,
                fee_amount INTEGER NOT NULL,
                ttl_slot INTEGER NOT NULL,
                selected_inputs TEXT NOT NULL,
                wallet_used TEXT NOT NULL,
                signed_at TEXT NOT NULL,
                check_count INTEGER NOT NULL DEFAULT 0,
                last_checked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS transactions (
                tx_hash TEXT PRIMARY KEY,
                request_id TEXT NOT NULL REFERENCES requests(id),
                fee_amount INTEGER NOT NULL,
                submission_mode TEXT NOT NULL,
                submitted_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
            CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_log(request_id);",
        )?;

        Ok(())
    }

    fn get_conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidValue(format!("bad timestamp {}: {}", value, e)))
}

fn parse_status(value: &str) -> Result<RequestStatus, StorageError> {
    value.parse().map_err(StorageError::InvalidValue)
}

struct RequestRow {
    id: String,
    status: String,
    recipient: String,
    amount_spec: String,
    ttl_slot: i64,
    created_at: String,
}

impl RequestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            recipient: row.get(2)?,
            amount_spec: row.get(3)?,
            ttl_slot: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_request(self) -> Result<Request, StorageError> {
        Ok(Request {
            id: self.id,
            status: parse_status(&self.status)?,
            recipient: self.recipient,
            amount_spec: serde_json::from_str(&self.amount_spec)?,
            ttl_slot: self.ttl_slot as u64,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct SignedRow {
    request_id: String,
    transaction_hash: String,
    encrypted_tx_body: String,
    encrypted_witness_set: String,
    encryption_metadata: String,
    fee_amount: i64,
    ttl_slot: i64,
    selected_inputs: String,
    wallet_used: String,
    signed_at: String,
    check_count: i64,
    last_checked_at: Option<String>,
}

impl SignedRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            transaction_hash: row.get(1)?,
            encrypted_tx_body: row.get(2)?,
            encrypted_witness_set: row.get(3)?,
            encryption_metadata: row.get(4)?,
            fee_amount: row.get(5)?,
            ttl_slot: row.get(6)?,
            selected_inputs: row.get(7)?,
            wallet_used: row.get(8)?,
            signed_at: row.get(9)?,
            check_count: row.get(10)?,
            last_checked_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<SignedRequestRecord, StorageError> {
        Ok(SignedRequestRecord {
            request_id: self.request_id,
            transaction_hash: self.transaction_hash,
            encrypted_tx_body: self.encrypted_tx_body,
            encrypted_witness_set: self.encrypted_witness_set,
            encryption_metadata: serde_json::from_str(&self.encryption_metadata)?,
            fee_amount: self.fee_amount as u64,
            ttl_slot: self.ttl_slot as u64,
            selected_inputs: serde_json::from_str(&self.selected_inputs)?,
            wallet_used: self.wallet_used,
            signed_at: parse_timestamp(&self.signed_at)?,
            check_count: self.check_count as u32,
            last_checked_at: self
                .last_checked_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

struct AuditRow {
    id: String,
    request_id: String,
    event_type: String,
    details: String,
    created_at: String,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            event_type: row.get(2)?,
            details: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_event(self) -> Result<AuditEvent, StorageError> {
        let event_type: AuditEventType =
            serde_json::from_value(serde_json::Value::String(self.event_type))?;
        Ok(AuditEvent {
            id: self.id,
            request_id: self.request_id,
            event_type,
            details: serde_json::from_str(&self.details)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl RequestDao for SqliteStore {
    fn insert_request(&self, request: &Request) -> Result<(), StorageError> {
        let conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO requests (id, status, recipient, amount_spec, ttl_slot, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                request.id,
                request.status.as_str(),
                request.recipient,
                serde_json::to_string(&request.amount_spec)?,
                request.ttl_slot as i64,
                request.created_at.to_rfc3339(),
                now,
            ],
        )?;

        Ok(())
    }

    fn get_request(&self, id: &str) -> Result<Option<Request>, StorageError> {
        let conn = self.get_conn()?;

        let row = conn
            .query_row(
                "SELECT id, status, recipient, amount_spec, ttl_slot, created_at
                 FROM requests WHERE id = ?",
                params![id],
                RequestRow::from_row,
            )
            .optional()?;

        row.map(RequestRow::into_request).transpose()
    }

    fn update_status(&self, id: &str, status: RequestStatus) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        let updated = conn.execute(
            "UPDATE requests SET status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!("request {}", id)));
        }
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<bool, StorageError> {
        let conn = self.get_conn()?;

        let updated = conn.execute(
            "UPDATE requests SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![to.as_str(), Utc::now().to_rfc3339(), id, from.as_str()],
        )?;

        Ok(updated == 1)
    }
}

impl PreSignedDao for SqliteStore {
    fn insert_signed(&self, record: &SignedRequestRecord) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            &format!(
                "INSERT INTO pre_signed_transactions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                SIGNED_COLUMNS
            ),
            params![
                record.request_id,
                record.transaction_hash,
                record.encrypted_tx_body,
                record.encrypted_witness_set,
                serde_json::to_string(&record.encryption_metadata)?,
                record.fee_amount as i64,
                record.ttl_slot as i64,
                serde_json::to_string(&record.selected_inputs)?,
                record.wallet_used,
                record.signed_at.to_rfc3339(),
                record.check_count as i64,
                record.last_checked_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        Ok(())
    }

    fn get_by_request_id(&self, request_id: &str) -> Result<Option<SignedRequestRecord>, StorageError> {
        let conn = self.get_conn()?;

        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pre_signed_transactions WHERE request_id = ?",
                    SIGNED_COLUMNS
                ),
                params![request_id],
                SignedRow::from_row,
            )
            .optional()?;

        row.map(SignedRow::into_record).transpose()
    }

    fn get_by_status(&self, status: RequestStatus) -> Result<Vec<SignedRequestRecord>, StorageError> {
        let conn = self.get_conn()?;

        let columns = SIGNED_COLUMNS
            .split(',')
            .map(|c| format!("p.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pre_signed_transactions p
             JOIN requests r ON r.id = p.request_id
             WHERE r.status = ?
             ORDER BY p.signed_at ASC",
            columns
        ))?;

        let rows = stmt
            .query_map(params![status.as_str()], SignedRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(SignedRow::into_record).collect()
    }

    fn get_complete_data(
        &self,
        request_id: &str,
    ) -> Result<Option<(Request, SignedRequestRecord)>, StorageError> {
        let request = match self.get_request(request_id)? {
            Some(request) => request,
            None => return Ok(None),
        };
        Ok(self
            .get_by_request_id(request_id)?
            .map(|signed| (request, signed)))
    }

    fn record_check(
        &self,
        request_id: &str,
        check_count: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE pre_signed_transactions SET check_count = ?, last_checked_at = ?
             WHERE request_id = ?",
            params![check_count as i64, checked_at.to_rfc3339(), request_id],
        )?;

        Ok(())
    }
}

impl TransactionDao for SqliteStore {
    fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT OR REPLACE INTO transactions (tx_hash, request_id, fee_amount, submission_mode, submitted_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.tx_hash,
                record.request_id,
                record.fee_amount as i64,
                record.submission_mode.as_str(),
                record.submitted_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn get_transaction_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<TransactionRecord>, StorageError> {
        let conn = self.get_conn()?;

        let row = conn
            .query_row(
                "SELECT tx_hash, request_id, fee_amount, submission_mode, submitted_at
                 FROM transactions WHERE request_id = ?
                 ORDER BY submitted_at DESC LIMIT 1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(tx_hash, request_id, fee_amount, mode, submitted_at)| {
            let submission_mode = match mode.as_str() {
                "server" => SubmissionMode::Server,
                "wallet" => SubmissionMode::Wallet,
                other => {
                    return Err(StorageError::InvalidValue(format!("submission mode {}", other)))
                }
            };
            Ok(TransactionRecord {
                tx_hash,
                request_id,
                fee_amount: fee_amount as u64,
                submission_mode,
                submitted_at: parse_timestamp(&submitted_at)?,
            })
        })
        .transpose()
    }
}

impl AuditDao for SqliteStore {
    fn log_event(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO audit_log (id, request_id, event_type, details, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                event.id,
                event.request_id,
                event.event_type.as_str(),
                serde_json::to_string(&event.details)?,
                event.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn events_for_request(&self, request_id: &str) -> Result<Vec<AuditEvent>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, request_id, event_type, details, created_at
             FROM audit_log WHERE request_id = ? ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![request_id], AuditRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(AuditRow::into_event).collect()
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, request_id, event_type, details, created_at
             FROM audit_log ORDER BY rowid DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], AuditRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(AuditRow::into_event).collect()
    }
}
