pub mod monitor;
pub mod requests;

use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::config::CardanoNetwork;
use crate::error::{EngineError, TransitionError, VaultError};
use crate::services::broadcast::EventBus;
use crate::services::monitor::UtxoMonitor;
use crate::services::presign::PreSignService;
use crate::services::slot_tracker::SlotTracker;
use crate::services::submission::SubmissionPipeline;
use crate::storage::Persistence;

#[derive(Clone)]
pub struct ApiState {
    pub network: CardanoNetwork,
    pub store: Arc<dyn Persistence>,
    pub presign: Arc<PreSignService>,
    pub pipeline: Arc<SubmissionPipeline>,
    pub monitor: Arc<UtxoMonitor>,
    pub slots: Arc<SlotTracker>,
    pub events: Arc<EventBus>,
}

pub(crate) fn error_response(context: &str, e: &EngineError) -> Response {
    let status = match e {
        EngineError::NotFound(_) | EngineError::Transition(TransitionError::RequestNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Expired { .. }
        | EngineError::Transition(TransitionError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        EngineError::InvalidRequest(_)
        | EngineError::Selection(_)
        | EngineError::Vault(
            VaultError::EmptyPayload(_) | VaultError::Malformed(_) | VaultError::InvalidRequestId { .. },
        ) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Error {}: {}", context, e);
    } else {
        tracing::debug!("Rejected {}: {}", context, e);
    }

    (
        status,
        Json(serde_json::json!({
            "error": e.to_string()
        })),
    )
        .into_response()
}
