use chrono::{Datelike, Duration, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::limits::MAX_OVERRIDE_REASON_LEN;
use crate::model::{Actor, Stamp};

use super::EngineError;

/// Notification window and hard-restriction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub notification_window_enabled: bool,
    /// 0 = Sunday … 6 = Saturday.
    pub window_day: u8,
    pub window_time: NaiveTime,
    pub hard_restriction_enabled: bool,
    pub hard_restriction_hours: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            notification_window_enabled: true,
            window_day: 4,
            window_time: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default(),
            hard_restriction_enabled: true,
            hard_restriction_hours: 12,
        }
    }
}

/// Deadline for sessions in the Monday-anchored week containing `session`:
/// the configured weekday/time in the week before.
pub fn notification_deadline(cfg: &GateConfig, session: Stamp) -> Stamp {
    let date = session.date();
    let week_start = date - Duration::days(date.weekday().num_days_from_monday() as i64);
    let days_from_monday = if cfg.window_day == 0 {
        6
    } else {
        cfg.window_day as i64 - 1
    };
    (week_start - Duration::days(7 - days_from_monday)).and_time(cfg.window_time)
}

/// Classification of one attempt. Holds no state between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub session_start: Stamp,
    /// `None` when the notification window is disabled.
    pub deadline: Option<Stamp>,
    pub late: bool,
    pub hard_blocked: bool,
    pub hours: u32,
}

/// Classify a session starting at `session_start`, as seen at `now`.
pub fn evaluate(cfg: &GateConfig, session_start: Stamp, now: Stamp) -> GateDecision {
    let deadline = cfg
        .notification_window_enabled
        .then(|| notification_deadline(cfg, session_start));
    let late = deadline.is_some_and(|d| now > d);
    let hard_blocked = cfg.hard_restriction_enabled
        && session_start - now < Duration::hours(cfg.hard_restriction_hours as i64);
    GateDecision {
        session_start,
        deadline,
        late,
        hard_blocked,
        hours: cfg.hard_restriction_hours,
    }
}

/// What an allowed attempt must record on the template.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Admission {
    pub late: bool,
    pub cutoff_at: Option<Stamp>,
    /// Set only when an admin pushed through the hard restriction.
    pub override_reason: Option<String>,
}

/// Turn a decision into `Allowed(normal | late)` or a block.
pub fn admit(decision: &GateDecision, actor: &Actor, reason: Option<&str>) -> Result<Admission, EngineError> {
    let mut admission = Admission {
        late: decision.late,
        cutoff_at: if decision.late { decision.deadline } else { None },
        override_reason: None,
    };
    if !decision.hard_blocked {
        return Ok(admission);
    }
    if !actor.is_admin {
        return Err(EngineError::HardRestriction {
            hours: decision.hours,
            session_start: decision.session_start,
        });
    }
    let reason = reason.map(str::trim).unwrap_or_default();
    if reason.is_empty() {
        return Err(EngineError::OverrideReasonRequired {
            hours: decision.hours,
            session_start: decision.session_start,
        });
    }
    if reason.len() > MAX_OVERRIDE_REASON_LEN {
        return Err(EngineError::Validation(vec![format!(
            "override reason longer than {MAX_OVERRIDE_REASON_LEN} characters"
        )]));
    }
    admission.override_reason = Some(reason.to_string());
    Ok(admission)
}
