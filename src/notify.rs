use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, RackNumber, Side, Stamp};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Instances,
    Extended,
    SessionRemoved,
}

/// Domain events published on a side's feed. Each variant carries only what
/// a listener of that event needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BookingEvent {
    Created {
        template_id: Ulid,
        side: Side,
        title: String,
        created_by: String,
        instance_count: usize,
        first_start: Stamp,
    },
    LastMinuteChange {
        template_id: Ulid,
        side: Side,
        title: String,
        cutoff_at: Stamp,
        session_start: Stamp,
    },
    HardRestrictionOverride {
        template_id: Ulid,
        side: Side,
        override_by: String,
        reason: String,
        session_start: Stamp,
    },
    Edited {
        template_id: Ulid,
        side: Side,
        edited_by: String,
        kind: EditKind,
    },
    Processed {
        template_id: Ulid,
        side: Side,
        processed_by: String,
    },
    StatusChanged {
        template_id: Ulid,
        side: Side,
        status: BookingStatus,
        by: String,
    },
    Cancelled {
        template_id: Ulid,
        side: Side,
        cancelled_by: String,
        /// `cancelled`, or `pending_cancellation` when a reviewer must act.
        status: BookingStatus,
    },
}

impl BookingEvent {
    pub fn side(&self) -> Side {
        match self {
            BookingEvent::Created { side, .. }
            | BookingEvent::LastMinuteChange { side, .. }
            | BookingEvent::HardRestrictionOverride { side, .. }
            | BookingEvent::Edited { side, .. }
            | BookingEvent::Processed { side, .. }
            | BookingEvent::StatusChanged { side, .. }
            | BookingEvent::Cancelled { side, .. } => *side,
        }
    }

    pub fn template_id(&self) -> Ulid {
        match self {
            BookingEvent::Created { template_id, .. }
            | BookingEvent::LastMinuteChange { template_id, .. }
            | BookingEvent::HardRestrictionOverride { template_id, .. }
            | BookingEvent::Edited { template_id, .. }
            | BookingEvent::Processed { template_id, .. }
            | BookingEvent::StatusChanged { template_id, .. }
            | BookingEvent::Cancelled { template_id, .. } => *template_id,
        }
    }
}

/// Broadcast hub for LISTEN/NOTIFY per side.
pub struct NotifyHub {
    channels: DashMap<Side, broadcast::Sender<BookingEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a side's feed. Creates the channel if needed.
    pub fn subscribe(&self, side: Side) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(side)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish on the event's side. No-op if nobody is listening.
    pub fn send(&self, event: &BookingEvent) {
        if let Some(sender) = self.channels.get(&event.side()) {
            let _ = sender.send(event.clone());
        }
    }
}

// ── Downstream collaborators ─────────────────────────────────────

/// A mail or task delivery the collaborator could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailKind {
    /// Late booking, to the configured recipients.
    LateAlert,
    /// Late booking, to the requester.
    LateConfirmation,
    /// Admin pushed through the hard restriction.
    OverrideAlert,
}

/// What to say and to whom. Rendering and transport belong to the mailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub kind: MailKind,
    pub recipients: Vec<String>,
    pub title: String,
    pub date: NaiveDate,
    pub time: String,
    pub side: Side,
    pub racks: Vec<RackNumber>,
    pub athletes: u32,
    pub creator: String,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "booking:created")]
    BookingCreated,
    #[serde(rename = "last_minute_change")]
    LastMinuteChange,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::BookingCreated => "booking:created",
            TaskKind::LastMinuteChange => "last_minute_change",
        }
    }
}

/// Reviewer work item for a new or late booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub kind: TaskKind,
    pub template_id: Ulid,
    pub link: String,
}

impl TaskEntry {
    pub fn new(kind: TaskKind, template_id: Ulid) -> Self {
        Self {
            kind,
            template_id,
            link: format!("/bookings/{template_id}"),
        }
    }
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn record(&self, entry: &TaskEntry) -> Result<(), DeliveryError>;
}

/// Mailer that only logs; used when no transport is wired in.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), DeliveryError> {
        tracing::info!(
            kind = ?mail.kind,
            recipients = mail.recipients.len(),
            title = %mail.title,
            date = %mail.date,
            side = %mail.side,
            "mail queued"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogTaskSink;

#[async_trait]
impl TaskSink for LogTaskSink {
    async fn record(&self, entry: &TaskEntry) -> Result<(), DeliveryError> {
        tracing::info!(kind = entry.kind.as_str(), template = %entry.template_id, "task recorded");
        Ok(())
    }
}
