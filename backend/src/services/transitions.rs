use super::broadcast::Broadcaster;
use crate::error::TransitionError;
use crate::models::{AuditEvent, BroadcastEvent, RequestStatus};
use crate::storage::Persistence;

const MAX_CAS_RETRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: RequestStatus },
    /// The request was already terminal; nothing was written.
    AlreadyTerminal(RequestStatus),
    /// Another owner moved the request out of the expected status first.
    Superseded(RequestStatus),
}

/// Moves a request to `next` through the store's compare-and-set.
///
/// Re-observing a terminal condition is a no-op, so callers only audit and
/// broadcast when the outcome is `Applied`.
pub fn apply_transition(
    store: &dyn Persistence,
    request_id: &str,
    next: RequestStatus,
) -> Result<TransitionOutcome, TransitionError> {
    for _ in 0..MAX_CAS_RETRIES {
        let current = store
            .get_request(request_id)?
            .ok_or_else(|| TransitionError::RequestNotFound(request_id.to_string()))?
            .status;

        if current.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(current));
        }
        current.transition(next)?;

        if store.compare_and_set_status(request_id, current, next)? {
            tracing::info!(
                request_id = %request_id,
                from = %current,
                to = %next,
                "Request status changed"
            );
            return Ok(TransitionOutcome::Applied { from: current });
        }
        tracing::debug!(request_id = %request_id, "Status changed concurrently, re-reading");
    }

    let current = store
        .get_request(request_id)?
        .ok_or_else(|| TransitionError::RequestNotFound(request_id.to_string()))?
        .status;
    Err(TransitionError::InvalidTransition { from: current, to: next })
}

/// Moves a request from exactly `from` to `next`.
///
/// Used by components that own a single status: if the request has left
/// `from` in the meantime, nothing is written and the current status is
/// reported back.
pub fn apply_transition_from(
    store: &dyn Persistence,
    request_id: &str,
    from: RequestStatus,
    next: RequestStatus,
) -> Result<TransitionOutcome, TransitionError> {
    from.transition(next)?;

    if store.compare_and_set_status(request_id, from, next)? {
        tracing::info!(
            request_id = %request_id,
            from = %from,
            to = %next,
            "Request status changed"
        );
        return Ok(TransitionOutcome::Applied { from });
    }

    let current = store
        .get_request(request_id)?
        .ok_or_else(|| TransitionError::RequestNotFound(request_id.to_string()))?
        .status;
    if current.is_terminal() {
        Ok(TransitionOutcome::AlreadyTerminal(current))
    } else {
        tracing::debug!(
            request_id = %request_id,
            expected = %from,
            current = %current,
            "Request moved on, skipping transition"
        );
        Ok(TransitionOutcome::Superseded(current))
    }
}

/// Persists `audit`, then emits `events`.
///
/// Clients are never told about something the audit log does not hold, so a
/// failed write suppresses the broadcast. Returns whether the audit landed.
pub fn audit_then_emit(
    store: &dyn Persistence,
    broadcaster: &dyn Broadcaster,
    audit: AuditEvent,
    events: Vec<BroadcastEvent>,
) -> bool {
    if let Err(e) = store.log_event(&audit) {
        tracing::error!(
            request_id = %audit.request_id,
            event_type = audit.event_type.as_str(),
            "Failed to write audit entry, suppressing broadcast: {}",
            e
        );
        return false;
    }
    for event in events {
        broadcaster.emit(event);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AmountSpec, Request};
    use crate::storage::{RequestDao, SqliteStore};

    fn store_with(status: RequestStatus) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_request(&Request::new("req-0001", "addr_test1vr", AmountSpec::Sweep, 1_000))
            .unwrap();
        if status != RequestStatus::Requested {
            store.update_status("req-0001", status).unwrap();
        }
        store
    }

    #[test]
    fn test_applies_valid_transition() {
        let store = store_with(RequestStatus::Signed);
        let outcome = apply_transition(&store, "req-0001", RequestStatus::Expired).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied { from: RequestStatus::Signed });
        assert_eq!(
            store.get_request("req-0001").unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }

    #[test]
    fn test_terminal_is_absorbing_and_idempotent() {
        let store = store_with(RequestStatus::Failed);
        for next in [RequestStatus::Failed, RequestStatus::Expired, RequestStatus::Confirmed] {
            let outcome = apply_transition(&store, "req-0001", next).unwrap();
            assert_eq!(outcome, TransitionOutcome::AlreadyTerminal(RequestStatus::Failed));
        }
    }

    #[test]
    fn test_rejects_skipped_states() {
        let store = store_with(RequestStatus::Signed);
        assert!(matches!(
            apply_transition(&store, "req-0001", RequestStatus::Submitted),
            Err(TransitionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            apply_transition(&store, "missing", RequestStatus::Failed),
            Err(TransitionError::RequestNotFound(_))
        ));
    }

    #[test]
    fn test_guarded_transition_leaves_other_owners_alone() {
        let store = store_with(RequestStatus::Submitted);
        let outcome =
            apply_transition_from(&store, "req-0001", RequestStatus::Signed, RequestStatus::Failed)
                .unwrap();
        assert_eq!(outcome, TransitionOutcome::Superseded(RequestStatus::Submitted));
        assert_eq!(
            store.get_request("req-0001").unwrap().unwrap().status,
            RequestStatus::Submitted
        );

        let outcome = apply_transition_from(
            &store,
            "req-0001",
            RequestStatus::Submitted,
            RequestStatus::Confirmed,
        )
        .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied { from: RequestStatus::Submitted });

        let outcome =
            apply_transition_from(&store, "req-0001", RequestStatus::Signed, RequestStatus::Expired)
                .unwrap();
        assert_eq!(outcome, TransitionOutcome::AlreadyTerminal(RequestStatus::Confirmed));
    }
}
