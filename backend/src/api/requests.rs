use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{error_response, ApiState};
use crate::error::EngineError;
use crate::models::{
    AmountSpec, AuditEvent, OutputRef, Request, SignedPayload, SubmissionMode, TransactionRecord,
    UnspentOutput,
};
use crate::services::coin_selection::SelectionStrategy;
use crate::services::submission::SubmissionResult;
use crate::services::wallet_bridge::{ReportedSubmission, WalletBridge};

/// Two hours, in slots.
const DEFAULT_TTL_SLOTS: u64 = 7_200;

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub recipient: String,
    pub amount: AmountSpec,
    /// Absolute TTL slot; wins over `ttl_slots`.
    pub ttl_slot: Option<u64>,
    /// TTL relative to the current slot.
    pub ttl_slots: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CandidateBody {
    pub utxos: Vec<UnspentOutput>,
    pub strategy: Option<String>,
    pub fee: u64,
    /// Price of one ADA in the request's fiat currency.
    pub rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WalletReport {
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub declined: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    #[serde(default = "default_mode")]
    pub mode: SubmissionMode,
    /// Outcome reported by the browser wallet in wallet mode.
    pub wallet: Option<WalletReport>,
}

fn default_mode() -> SubmissionMode {
    SubmissionMode::Server
}

#[derive(Debug, Serialize)]
pub struct SignedSummary {
    pub transaction_hash: String,
    pub fee_amount: u64,
    pub ttl_slot: u64,
    pub inputs: Vec<OutputRef>,
    pub wallet_used: String,
    pub check_count: u32,
}

#[derive(Debug, Serialize)]
pub struct RequestDetails {
    #[serde(flatten)]
    pub request: Request,
    pub signed: Option<SignedSummary>,
    pub transaction: Option<TransactionRecord>,
    pub audit: Vec<AuditEvent>,
}

pub async fn create_request(
    State(state): State<ApiState>,
    Json(body): Json<CreateRequestBody>,
) -> impl IntoResponse {
    let ttl_slot = match resolve_ttl_slot(&body, state.slots.current_slot()) {
        Ok(slot) => slot,
        Err(e) => return error_response("creating request", &e),
    };

    match state.presign.create_request(&body.recipient, body.amount, ttl_slot) {
        Ok(request) => (StatusCode::CREATED, Json(request)).into_response(),
        Err(e) => error_response("creating request", &e),
    }
}

fn resolve_ttl_slot(body: &CreateRequestBody, current_slot: u64) -> Result<u64, EngineError> {
    if let Some(slot) = body.ttl_slot {
        return Ok(slot);
    }
    let ttl_slots = body.ttl_slots.unwrap_or(DEFAULT_TTL_SLOTS);
    current_slot
        .checked_add(ttl_slots)
        .ok_or_else(|| EngineError::InvalidRequest(format!("ttl_slots {} is out of range", ttl_slots)))
}

pub async fn get_request(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match load_details(&state, &request_id) {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => error_response("loading request", &e),
    }
}

fn load_details(state: &ApiState, request_id: &str) -> Result<RequestDetails, EngineError> {
    let request = state.presign.get_request(request_id)?;
    let signed = state
        .store
        .get_by_request_id(request_id)?
        .map(|record| SignedSummary {
            inputs: record.selected_inputs.iter().map(UnspentOutput::output_ref).collect(),
            transaction_hash: record.transaction_hash,
            fee_amount: record.fee_amount,
            ttl_slot: record.ttl_slot,
            wallet_used: record.wallet_used,
            check_count: record.check_count,
        });
    let transaction = state.store.get_transaction_for_request(request_id)?;
    let audit = state.store.events_for_request(request_id)?;

    Ok(RequestDetails {
        request,
        signed,
        transaction,
        audit,
    })
}

pub async fn build_candidate(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
    Json(body): Json<CandidateBody>,
) -> impl IntoResponse {
    let strategy = match parse_strategy(body.strategy.as_deref()) {
        Ok(strategy) => strategy,
        Err(e) => return error_response("planning inputs", &e),
    };

    match state
        .presign
        .plan_inputs(&request_id, &body.utxos, strategy, body.fee, body.rate)
    {
        Ok(plan) => (StatusCode::OK, Json(plan)).into_response(),
        Err(e) => error_response("planning inputs", &e),
    }
}

fn parse_strategy(raw: Option<&str>) -> Result<SelectionStrategy, EngineError> {
    match raw {
        None => Ok(SelectionStrategy::LargestFirst),
        Some(name) => name.parse().map_err(EngineError::InvalidRequest),
    }
}

pub async fn register_signed(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
    Json(payload): Json<SignedPayload>,
) -> impl IntoResponse {
    match state.presign.register_signed(&request_id, payload) {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "request_id": record.request_id,
                "transaction_hash": record.transaction_hash,
                "ttl_slot": record.ttl_slot,
                "status": "SIGNED",
            })),
        )
            .into_response(),
        Err(e) => error_response("registering signed payload", &e),
    }
}

pub async fn submit(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let wallet: Option<Arc<dyn WalletBridge>> = body.wallet.map(|report| {
        let bridge = match report {
            WalletReport { declined: true, .. } => ReportedSubmission::declined(),
            WalletReport {
                tx_hash: Some(hash), ..
            } => ReportedSubmission::submitted(hash),
            WalletReport { error, .. } => {
                ReportedSubmission::failed(error.unwrap_or_else(|| "wallet submission failed".into()))
            }
        };
        Arc::new(bridge) as Arc<dyn WalletBridge>
    });

    let result = state.pipeline.submit(&request_id, body.mode, wallet).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(result)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub request_ids: Vec<String>,
    /// One at a time with a pause in between instead of concurrently.
    #[serde(default)]
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub request_id: String,
    #[serde(flatten)]
    pub result: SubmissionResult,
}

pub async fn submit_batch(
    State(state): State<ApiState>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    if body.request_ids.is_empty() {
        return error_response(
            "submitting batch",
            &EngineError::InvalidRequest("request_ids is empty".into()),
        );
    }

    let entries: Vec<BatchEntry> = if body.queued {
        let results = state.pipeline.submit_queued(&body.request_ids).await;
        body.request_ids
            .into_iter()
            .zip(results)
            .map(|(request_id, result)| BatchEntry { request_id, result })
            .collect()
    } else {
        state
            .pipeline
            .submit_batch(body.request_ids)
            .await
            .into_iter()
            .map(|(request_id, result)| BatchEntry { request_id, result })
            .collect()
    };

    let succeeded = entries.iter().filter(|entry| entry.result.success).count();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "submitted": succeeded,
            "failed": entries.len() - succeeded,
            "results": entries,
        })),
    )
        .into_response()
}

pub async fn cancel(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.cancel(&request_id) {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "cancelled": cancelled })),
        )
            .into_response(),
        Err(e) => error_response("cancelling request", &e),
    }
}
