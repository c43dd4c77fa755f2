pub mod events;
pub mod request;
pub mod signed;
pub mod utxo;

pub use events::{AuditEvent, AuditEventType, BroadcastEvent, TtlStatus};
pub use request::{AmountSpec, Request, RequestStatus};
pub use signed::{
    EncryptionMetadata, FieldEncryption, SignedPayload, SignedRequestRecord, SubmissionMode,
    TransactionRecord,
};
pub use utxo::{NativeAssets, OutputRef, UnspentOutput};
