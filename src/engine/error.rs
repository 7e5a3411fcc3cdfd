use ulid::Ulid;

use crate::model::{BookingStatus, Stamp};
use crate::store::StoreError;

use super::capacity::CapacityReport;
use super::conflict::ConflictReport;

#[derive(Debug)]
pub enum EngineError {
    /// Input problems found before any store interaction, one line each.
    Validation(Vec<String>),
    Conflict(ConflictReport),
    Capacity(CapacityReport),
    /// Session starts inside the hard-restriction lead time.
    HardRestriction { hours: u32, session_start: Stamp },
    /// Admin inside the hard-restriction lead time without a reason.
    OverrideReasonRequired { hours: u32, session_start: Stamp },
    Locked(Ulid),
    Forbidden(&'static str),
    InvalidState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    Store(StoreError),
    /// Template row written but its instances were not; `rollback` is the
    /// error from deleting the orphaned row, if that failed too.
    PartialWrite {
        cause: StoreError,
        rollback: Option<StoreError>,
    },
}

impl EngineError {
    /// Short label for metrics and wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Capacity(_) => "capacity",
            EngineError::HardRestriction { .. } => "hard_restriction",
            EngineError::OverrideReasonRequired { .. } => "override_reason_required",
            EngineError::Locked(_) => "locked",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store",
            EngineError::PartialWrite { .. } => "partial_write",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(problems) => {
                write!(f, "invalid booking: {}", problems.join("; "))
            }
            EngineError::Conflict(report) => write!(f, "{report}"),
            EngineError::Capacity(report) => write!(f, "{report}"),
            EngineError::HardRestriction { hours, session_start } => write!(
                f,
                "bookings cannot be made or changed within {hours} hours of the session \
                 ({}); please arrange this in person with facility staff",
                session_start.format("%a %b %-d %H:%M")
            ),
            EngineError::OverrideReasonRequired { hours, session_start } => write!(
                f,
                "session at {} is within the {hours}-hour restriction; an override reason is required",
                session_start.format("%a %b %-d %H:%M")
            ),
            EngineError::Locked(id) => write!(f, "booking {id} is locked; only admins can change it"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidState { id, status, action } => {
                write!(f, "cannot {action} booking {id} while it is {}", status.as_str())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
            EngineError::PartialWrite { cause, rollback: None } => {
                write!(f, "booking not created, instance write failed: {cause}")
            }
            EngineError::PartialWrite { cause, rollback: Some(r) } => write!(
                f,
                "booking not created, instance write failed: {cause}; rollback also failed: {r}"
            ),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}
