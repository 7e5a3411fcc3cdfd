mod capacity;
mod conflict;
mod diff;
mod error;
mod gate;
mod materialize;
mod mutations;
mod queries;

pub use capacity::{check_capacity, CapacityReport, CapacityViolation};
pub use conflict::{ConflictRecord, ConflictReport};
pub use diff::{diff, Change, ChangeKind, ChangeReport, SnapshotTier};
pub use error::EngineError;
pub use gate::{admit, evaluate, notification_deadline, Admission, GateConfig, GateDecision};
pub use materialize::{materialize, materialize_weeks, validate_template};
pub use mutations::{Extension, InstanceEdit, SubmitOutcome, TemplateDraft};
pub use queries::BookingView;

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{BookingEvent, LogMailer, LogTaskSink, Mail, MailKind, Mailer, NotifyHub, TaskEntry, TaskKind, TaskSink};
use crate::observability;
use crate::store::BookingStore;

/// Policy knobs the engine reads on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub gate: GateConfig,
    /// Who gets late-booking and override alerts.
    pub alert_recipients: Vec<String>,
    /// How far a live session may drift from a projected legacy date and
    /// still count as the same session.
    pub legacy_tolerance: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            alert_recipients: Vec::new(),
            legacy_tolerance: chrono::Duration::days(1),
        }
    }
}

pub struct Engine {
    pub(super) store: Arc<dyn BookingStore>,
    pub notify: Arc<NotifyHub>,
    pub(super) mailer: Arc<dyn Mailer>,
    pub(super) tasks: Arc<dyn TaskSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// One advisory lock per side, held from the first conflict read to the
    /// last write of a mutation.
    side_locks: [Mutex<()>; 2],
}

/// Downstream work queued by a successful write. Delivered after the write
/// commits; failures only become warnings.
#[derive(Debug, Default)]
pub(super) struct Announcement {
    pub events: Vec<BookingEvent>,
    pub tasks: Vec<TaskEntry>,
    pub mails: Vec<Mail>,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, notify: Arc<NotifyHub>, settings: EngineSettings) -> Self {
        Self {
            store,
            notify,
            mailer: Arc::new(LogMailer),
            tasks: Arc::new(LogTaskSink),
            clock: Arc::new(SystemClock),
            settings,
            side_locks: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskSink>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn side_lock(&self, side: Side) -> &Mutex<()> {
        match side {
            Side::Power => &self.side_locks[0],
            Side::Base => &self.side_locks[1],
        }
    }

    pub(super) async fn load_template(&self, id: Ulid) -> Result<BookingTemplate, EngineError> {
        self.store
            .get_template(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Take the booking's side lock, then read the template under it. Every
    /// status or editability check must run on this copy. A booking never
    /// changes side, so the first read only picks the lock.
    pub(super) async fn lock_template(
        &self,
        id: Ulid,
    ) -> Result<(MutexGuard<'_, ()>, BookingTemplate), EngineError> {
        let side = self.load_template(id).await?.side;
        let guard = self.side_lock(side).lock().await;
        let template = self.load_template(id).await?;
        Ok((guard, template))
    }

    /// Shared guard for anything that changes a booking's sessions.
    pub(super) fn ensure_editable(
        &self,
        actor: &Actor,
        template: &BookingTemplate,
        action: &'static str,
    ) -> Result<(), EngineError> {
        if template.status.is_terminal() || template.status == BookingStatus::PendingCancellation {
            return Err(EngineError::InvalidState {
                id: template.id,
                status: template.status,
                action,
            });
        }
        if template.locked && !actor.is_admin {
            return Err(EngineError::Locked(template.id));
        }
        Ok(())
    }

    /// Template row first, then its instances. If the instances fail the
    /// template row is deleted again before the error is returned.
    pub(super) async fn create_or_rollback(
        &self,
        template: &BookingTemplate,
        instances: &[BookingInstance],
    ) -> Result<(), EngineError> {
        self.store.insert_template(template).await?;
        let Err(cause) = self.store.insert_instances(instances).await else {
            return Ok(());
        };
        let rollback = match self.store.delete_template(template.id).await {
            Ok(()) => {
                metrics::counter!(observability::ROLLBACKS_TOTAL, "result" => "ok").increment(1);
                tracing::warn!(template = %template.id, "instance write failed, template removed: {cause}");
                None
            }
            Err(e) => {
                metrics::counter!(observability::ROLLBACKS_TOTAL, "result" => "failed").increment(1);
                tracing::error!(template = %template.id, "rollback of orphaned template failed: {e}");
                Some(e)
            }
        };
        Err(EngineError::PartialWrite { cause, rollback })
    }

    /// Queue the late/override follow-ups for a gated write.
    pub(super) fn gate_followups(
        &self,
        template: &BookingTemplate,
        earliest: &BookingInstance,
        admission: &Admission,
        actor: &Actor,
        out: &mut Announcement,
    ) {
        let mail = |kind: MailKind, recipients: Vec<String>| Mail {
            kind,
            recipients,
            title: template.title.clone(),
            date: earliest.span.start.date(),
            time: format!(
                "{}–{}",
                earliest.span.start.format("%H:%M"),
                earliest.span.end.format("%H:%M")
            ),
            side: template.side,
            racks: earliest.racks.clone(),
            athletes: earliest.capacity,
            creator: template.created_by.clone(),
            reason: admission.override_reason.clone(),
        };

        if let (true, Some(cutoff_at)) = (admission.late, admission.cutoff_at) {
            out.events.push(BookingEvent::LastMinuteChange {
                template_id: template.id,
                side: template.side,
                title: template.title.clone(),
                cutoff_at,
                session_start: earliest.span.start,
            });
            out.tasks.push(TaskEntry::new(TaskKind::LastMinuteChange, template.id));
            if !self.settings.alert_recipients.is_empty() {
                out.mails.push(mail(MailKind::LateAlert, self.settings.alert_recipients.clone()));
            }
            out.mails.push(mail(MailKind::LateConfirmation, vec![actor.id.clone()]));
        }

        if let Some(reason) = &admission.override_reason {
            metrics::counter!(observability::OVERRIDES_TOTAL).increment(1);
            tracing::info!(template = %template.id, admin = %actor.id, "hard restriction overridden: {reason}");
            out.events.push(BookingEvent::HardRestrictionOverride {
                template_id: template.id,
                side: template.side,
                override_by: actor.id.clone(),
                reason: reason.clone(),
                session_start: earliest.span.start,
            });
            if !self.settings.alert_recipients.is_empty() {
                out.mails.push(mail(MailKind::OverrideAlert, self.settings.alert_recipients.clone()));
            }
        }
    }

    /// Publish, record and mail. Never fails; problems come back as warnings.
    pub(super) async fn announce(&self, announcement: Announcement) -> Vec<String> {
        for event in &announcement.events {
            self.notify.send(event);
        }
        let mut warnings = Vec::new();
        for entry in &announcement.tasks {
            if let Err(e) = self.tasks.record(entry).await {
                metrics::counter!(observability::DOWNSTREAM_FAILURES_TOTAL, "collaborator" => "tasks").increment(1);
                tracing::warn!(template = %entry.template_id, "task {} not recorded: {e}", entry.kind.as_str());
                warnings.push(format!("reviewer task was not recorded: {e}"));
            }
        }
        for mail in &announcement.mails {
            if let Err(e) = self.mailer.send(mail).await {
                metrics::counter!(observability::DOWNSTREAM_FAILURES_TOTAL, "collaborator" => "mailer").increment(1);
                tracing::warn!(kind = ?mail.kind, "mail not sent: {e}");
                warnings.push(format!("{:?} mail was not sent: {e}", mail.kind));
            }
        }
        warnings
    }
}
