use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SelectionError, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Requested,
    Signed,
    Submitting,
    Submitted,
    Confirmed,
    Failed,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Requested => "REQUESTED",
            RequestStatus::Signed => "SIGNED",
            RequestStatus::Submitting => "SUBMITTING",
            RequestStatus::Submitted => "SUBMITTED",
            RequestStatus::Confirmed => "CONFIRMED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Confirmed | RequestStatus::Failed | RequestStatus::Expired
        )
    }

    /// Forward edges only; FAILED and EXPIRED are reachable from any live state.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Requested, Signed)
                | (Signed, Submitting)
                | (Submitting, Submitted)
                | (Submitted, Confirmed)
                | (_, Failed)
                | (_, Expired)
        )
    }

    pub fn transition(self, next: RequestStatus) -> Result<RequestStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "REQUESTED" => Ok(RequestStatus::Requested),
            "SIGNED" => Ok(RequestStatus::Signed),
            "SUBMITTING" => Ok(RequestStatus::Submitting),
            "SUBMITTED" => Ok(RequestStatus::Submitted),
            "CONFIRMED" => Ok(RequestStatus::Confirmed),
            "FAILED" => Ok(RequestStatus::Failed),
            "EXPIRED" => Ok(RequestStatus::Expired),
            other => Err(format!("unknown request status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AmountSpec {
    Fixed { lovelace: u64 },
    /// Everything available at the custodial address.
    Sweep,
    /// Fiat-denominated amount converted at the current ADA rate.
    RateBased { fiat_amount: f64, currency: String },
}

impl AmountSpec {
    /// Lovelace to send, before fees.
    ///
    /// `rate` is the price of one ADA in the rule's currency and is only
    /// consulted for rate-based requests.
    pub fn resolve(&self, available: u64, rate: Option<f64>) -> Result<u64, SelectionError> {
        match self {
            AmountSpec::Fixed { lovelace } => Ok(*lovelace),
            AmountSpec::Sweep => Ok(available),
            AmountSpec::RateBased { fiat_amount, currency } => {
                let rate = rate.filter(|r| r.is_finite() && *r > 0.0).ok_or_else(|| {
                    SelectionError::UnresolvedAmount(format!("no ADA/{} rate available", currency))
                })?;
                if !fiat_amount.is_finite() || *fiat_amount < 0.0 {
                    return Err(SelectionError::UnresolvedAmount(format!(
                        "invalid fiat amount {}",
                        fiat_amount
                    )));
                }
                Ok((fiat_amount / rate * 1_000_000.0).ceil() as u64)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub status: RequestStatus,
    pub recipient: String,
    pub amount_spec: AmountSpec,
    pub ttl_slot: u64,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        recipient: impl Into<String>,
        amount_spec: AmountSpec,
        ttl_slot: u64,
    ) -> Self {
        Self {
            id: id.into(),
            status: RequestStatus::Requested,
            recipient: recipient.into(),
            amount_spec,
            ttl_slot,
            created_at: Utc::now(),
        }
    }
}
