use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{BookingEvent, EditKind, TaskEntry, TaskKind};
use crate::observability;

use super::capacity::validate_capacity;
use super::conflict::detect_conflicts;
use super::gate::{admit, evaluate, Admission};
use super::materialize::{capacity_problem, materialize, materialize_weeks, rack_problems, span_problem, validate_template};
use super::{Announcement, Engine, EngineError};

fn default_capacity() -> u32 {
    1
}

/// What a caller submits to create a recurring booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub side: Side,
    pub title: String,
    /// Date and start time of the first session.
    pub start: Stamp,
    pub end_time: NaiveTime,
    pub week_count: u32,
    #[serde(default)]
    pub racks_by_week: BTreeMap<WeekIndex, Vec<RackNumber>>,
    /// Racks for any week not listed in `racks_by_week`.
    #[serde(default)]
    pub racks: Vec<RackNumber>,
    #[serde(default)]
    pub capacity_by_week: BTreeMap<WeekIndex, u32>,
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub override_reason: Option<String>,
}

impl TemplateDraft {
    fn into_template(self, actor: &Actor, now: Stamp) -> BookingTemplate {
        let mut racks_by_week = self.racks_by_week;
        if !self.racks.is_empty() {
            for week in 0..self.week_count.min(MAX_WEEKS) {
                racks_by_week.entry(week).or_insert_with(|| self.racks.clone());
            }
        }
        BookingTemplate {
            id: Ulid::new(),
            side: self.side,
            title: self.title.trim().to_string(),
            // Not `Span::new`: an inverted span must reach validation.
            first: Span {
                start: self.start,
                end: self.start.date().and_time(self.end_time),
            },
            week_count: self.week_count,
            racks_by_week,
            capacity_by_week: self.capacity_by_week,
            default_capacity: self.default_capacity,
            areas: self.areas,
            locked: self.locked,
            status: BookingStatus::Pending,
            created_by: actor.id.clone(),
            created_at: now,
            last_edited_by: None,
            last_edited_at: None,
            processed_by: None,
            processed_at: None,
            last_minute_change: false,
            cutoff_at: None,
            override_by: None,
            override_reason: None,
        }
    }
}

/// Result of any write that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub template_id: Ulid,
    /// Occurrences written by this call.
    pub instance_count: usize,
    pub last_minute_change: bool,
    pub cutoff_at: Option<Stamp>,
    /// Some slot now sits exactly at its capacity ceiling.
    pub capacity_warnings: bool,
    /// Downstream problems that did not undo the write.
    pub warnings: Vec<String>,
}

/// New values for one existing occurrence. Absent fields keep their value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEdit {
    pub instance_id: Ulid,
    #[serde(default)]
    pub racks: Option<Vec<RackNumber>>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub start: Option<Stamp>,
    #[serde(default)]
    pub end: Option<Stamp>,
}

/// Weeks appended to an existing booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub additional_weeks: u32,
    /// Keyed by absolute week index.
    #[serde(default)]
    pub racks_by_week: BTreeMap<WeekIndex, Vec<RackNumber>>,
    /// Racks for new weeks not listed above; defaults to the last week's racks.
    #[serde(default)]
    pub racks: Vec<RackNumber>,
    #[serde(default)]
    pub capacity_by_week: BTreeMap<WeekIndex, u32>,
    #[serde(default)]
    pub override_reason: Option<String>,
}

fn earliest(instances: &[BookingInstance]) -> Option<&BookingInstance> {
    instances.iter().min_by_key(|i| i.span.start)
}

fn record_admission(template: &mut BookingTemplate, admission: &Admission, actor: &Actor) {
    if admission.late {
        template.last_minute_change = true;
        template.cutoff_at = admission.cutoff_at;
    }
    if let Some(reason) = &admission.override_reason {
        template.override_by = Some(actor.id.clone());
        template.override_reason = Some(reason.clone());
    }
}

impl Engine {
    /// Materialize, check conflicts and capacity, gate, then write the
    /// template with all its occurrences or nothing at all.
    pub async fn submit_booking(&self, actor: &Actor, draft: TemplateDraft) -> Result<SubmitOutcome, EngineError> {
        if draft.locked && !actor.is_admin {
            return Err(EngineError::Forbidden("only admins can lock bookings"));
        }
        let now = self.clock.now();
        let reason = draft.override_reason.clone();
        let mut template = draft.into_template(actor, now);
        let instances = materialize(&template)?;
        let side = template.side;

        let guard = self.side_lock(side).lock().await;

        let conflicts = detect_conflicts(self.store.as_ref(), side, &instances, None).await?;
        if !conflicts.is_empty() {
            return Err(EngineError::Conflict(conflicts));
        }
        let capacity = validate_capacity(self.store.as_ref(), side, &instances, None).await?;
        if !capacity.is_valid() {
            return Err(EngineError::Capacity(capacity));
        }

        let Some(first) = earliest(&instances) else {
            return Err(EngineError::Validation(vec!["at least one week is required".into()]));
        };
        let decision = evaluate(&self.settings.gate, first.span.start, now);
        let admission = admit(&decision, actor, reason.as_deref())?;
        record_admission(&mut template, &admission, actor);

        self.create_or_rollback(&template, &instances).await?;
        drop(guard);

        metrics::counter!(
            observability::SUBMISSIONS_TOTAL,
            "side" => side.as_str(),
            "late" => if admission.late { "true" } else { "false" }
        )
        .increment(1);
        metrics::histogram!(observability::INSTANCES_PER_SUBMISSION).record(instances.len() as f64);
        tracing::info!(
            template = %template.id,
            side = %side,
            weeks = instances.len(),
            late = admission.late,
            "booking created by {}",
            actor.id
        );

        let mut announcement = Announcement::default();
        announcement.events.push(BookingEvent::Created {
            template_id: template.id,
            side,
            title: template.title.clone(),
            created_by: actor.id.clone(),
            instance_count: instances.len(),
            first_start: first.span.start,
        });
        announcement.tasks.push(TaskEntry::new(TaskKind::BookingCreated, template.id));
        self.gate_followups(&template, first, &admission, actor, &mut announcement);
        let warnings = self.announce(announcement).await;

        Ok(SubmitOutcome {
            template_id: template.id,
            instance_count: instances.len(),
            last_minute_change: admission.late,
            cutoff_at: admission.cutoff_at,
            capacity_warnings: capacity.has_warnings,
            warnings,
        })
    }

    /// Change racks, athlete count or times of individual occurrences.
    pub async fn edit_instances(
        &self,
        actor: &Actor,
        template_id: Ulid,
        edits: Vec<InstanceEdit>,
        override_reason: Option<String>,
    ) -> Result<SubmitOutcome, EngineError> {
        if edits.is_empty() {
            return Err(EngineError::Validation(vec!["no changes given".into()]));
        }
        if edits.len() > MAX_EDITS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many edits in one request"));
        }
        let (guard, mut template) = self.lock_template(template_id).await?;
        self.ensure_editable(actor, &template, "edit")?;
        let side = template.side;
        let now = self.clock.now();

        let mut before = Vec::with_capacity(edits.len());
        let mut after = Vec::with_capacity(edits.len());
        let mut problems = Vec::new();
        for edit in &edits {
            let old = self
                .store
                .get_instance(edit.instance_id)
                .await?
                .filter(|i| i.template_id == template_id)
                .ok_or(EngineError::NotFound(edit.instance_id))?;
            let mut new = old.clone();
            if let Some(racks) = &edit.racks {
                problems.extend(rack_problems(old.week, racks));
                new.racks = racks.clone();
            }
            if let Some(capacity) = edit.capacity {
                problems.extend(capacity_problem(old.week, capacity));
                new.capacity = capacity;
            }
            new.span = Span {
                start: edit.start.unwrap_or(old.span.start),
                end: edit.end.unwrap_or(old.span.end),
            };
            if let Some(p) = span_problem(&new.span) {
                problems.push(format!("Week {}: {p}", old.week + 1));
            }
            before.push(old);
            after.push(new);
        }
        if !problems.is_empty() {
            return Err(EngineError::Validation(problems));
        }

        let conflicts = detect_conflicts(self.store.as_ref(), side, &after, Some(template_id)).await?;
        if !conflicts.is_empty() {
            return Err(EngineError::Conflict(conflicts));
        }
        let capacity = validate_capacity(self.store.as_ref(), side, &after, Some(template_id)).await?;
        if !capacity.is_valid() {
            return Err(EngineError::Capacity(capacity));
        }

        // Moving a session earlier or later both count from whichever is sooner.
        let affected: Vec<BookingInstance> = before.iter().chain(after.iter()).cloned().collect();
        let Some(first) = earliest(&affected).cloned() else {
            return Err(EngineError::Validation(vec!["no changes given".into()]));
        };
        let decision = evaluate(&self.settings.gate, first.span.start, now);
        let admission = admit(&decision, actor, override_reason.as_deref())?;

        for (i, new) in after.iter().enumerate() {
            if let Err(e) = self.store.update_instance(new).await {
                for old in &before[..i] {
                    if let Err(restore) = self.store.update_instance(old).await {
                        tracing::error!(instance = %old.id, "restoring instance after failed edit: {restore}");
                    }
                }
                return Err(e.into());
            }
        }

        for new in &after {
            template.racks_by_week.insert(new.week, new.racks.clone());
            if new.capacity != template.default_capacity || template.capacity_by_week.contains_key(&new.week) {
                template.capacity_by_week.insert(new.week, new.capacity);
            }
        }
        template.touch_edit(actor, now);
        record_admission(&mut template, &admission, actor);
        self.store.update_template(&template).await?;
        drop(guard);

        tracing::info!(template = %template_id, edited = after.len(), "instances edited by {}", actor.id);
        let mut announcement = Announcement::default();
        announcement.events.push(BookingEvent::Edited {
            template_id,
            side,
            edited_by: actor.id.clone(),
            kind: EditKind::Instances,
        });
        self.gate_followups(&template, &first, &admission, actor, &mut announcement);
        let warnings = self.announce(announcement).await;

        Ok(SubmitOutcome {
            template_id,
            instance_count: after.len(),
            last_minute_change: admission.late,
            cutoff_at: admission.cutoff_at,
            capacity_warnings: capacity.has_warnings,
            warnings,
        })
    }

    /// Append weeks after the booking's current last week.
    pub async fn extend_booking(
        &self,
        actor: &Actor,
        template_id: Ulid,
        extension: Extension,
    ) -> Result<SubmitOutcome, EngineError> {
        let (guard, mut template) = self.lock_template(template_id).await?;
        self.ensure_editable(actor, &template, "extend")?;
        let now = self.clock.now();
        if extension.additional_weeks == 0 {
            return Err(EngineError::Validation(vec!["at least one week must be added".into()]));
        }
        let old_count = template.week_count;
        let new_count = old_count.saturating_add(extension.additional_weeks);
        if new_count > MAX_WEEKS {
            return Err(EngineError::LimitExceeded("booking would exceed the maximum number of weeks"));
        }

        let fallback = if extension.racks.is_empty() {
            template.racks_for_week(old_count.saturating_sub(1)).to_vec()
        } else {
            extension.racks.clone()
        };
        for week in old_count..new_count {
            let racks = extension.racks_by_week.get(&week).cloned().unwrap_or_else(|| fallback.clone());
            template.racks_by_week.insert(week, racks);
        }
        for (&week, &capacity) in &extension.capacity_by_week {
            if week < old_count {
                return Err(EngineError::Validation(vec![format!(
                    "Week {} already exists; edit it instead",
                    week + 1
                )]));
            }
            template.capacity_by_week.insert(week, capacity);
        }
        template.week_count = new_count;
        validate_template(&template)?;
        let added = materialize_weeks(&template, old_count..new_count);
        let side = template.side;

        let conflicts = detect_conflicts(self.store.as_ref(), side, &added, Some(template_id)).await?;
        if !conflicts.is_empty() {
            return Err(EngineError::Conflict(conflicts));
        }
        let capacity = validate_capacity(self.store.as_ref(), side, &added, Some(template_id)).await?;
        if !capacity.is_valid() {
            return Err(EngineError::Capacity(capacity));
        }
        let Some(first) = earliest(&added).cloned() else {
            return Err(EngineError::Validation(vec!["at least one week must be added".into()]));
        };
        let decision = evaluate(&self.settings.gate, first.span.start, now);
        let admission = admit(&decision, actor, extension.override_reason.as_deref())?;

        template.touch_edit(actor, now);
        record_admission(&mut template, &admission, actor);
        self.store.insert_instances(&added).await?;
        if let Err(e) = self.store.update_template(&template).await {
            for i in &added {
                if let Err(cleanup) = self.store.delete_instance(i.id).await {
                    tracing::error!(instance = %i.id, "removing added week after failed extension: {cleanup}");
                }
            }
            return Err(e.into());
        }
        drop(guard);

        tracing::info!(template = %template_id, added = added.len(), "booking extended by {}", actor.id);
        let mut announcement = Announcement::default();
        announcement.events.push(BookingEvent::Edited {
            template_id,
            side,
            edited_by: actor.id.clone(),
            kind: EditKind::Extended,
        });
        self.gate_followups(&template, &first, &admission, actor, &mut announcement);
        let warnings = self.announce(announcement).await;

        Ok(SubmitOutcome {
            template_id,
            instance_count: added.len(),
            last_minute_change: admission.late,
            cutoff_at: admission.cutoff_at,
            capacity_warnings: capacity.has_warnings,
            warnings,
        })
    }

    /// Drop one occurrence. A booking left with no occurrences is cancelled.
    /// Returns the booking's resulting status.
    pub async fn remove_instance(
        &self,
        actor: &Actor,
        instance_id: Ulid,
        override_reason: Option<String>,
    ) -> Result<BookingStatus, EngineError> {
        let template_id = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(EngineError::NotFound(instance_id))?
            .template_id;
        let (guard, mut template) = self.lock_template(template_id).await?;
        // Re-read: the session may have gone while we waited for the lock.
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(EngineError::NotFound(instance_id))?;
        self.ensure_editable(actor, &template, "remove a session from")?;
        let now = self.clock.now();

        let decision = evaluate(&self.settings.gate, instance.span.start, now);
        let admission = admit(&decision, actor, override_reason.as_deref())?;

        self.store.delete_instance(instance_id).await?;
        let remaining = self.store.instances_for_template(template.id).await?;
        template.touch_edit(actor, now);
        record_admission(&mut template, &admission, actor);
        if remaining.is_empty() {
            template.status = BookingStatus::Cancelled;
        }
        self.store.update_template(&template).await?;
        drop(guard);

        tracing::info!(template = %template.id, instance = %instance_id, "session removed by {}", actor.id);
        let mut announcement = Announcement::default();
        announcement.events.push(if remaining.is_empty() {
            BookingEvent::Cancelled {
                template_id: template.id,
                side: template.side,
                cancelled_by: actor.id.clone(),
                status: BookingStatus::Cancelled,
            }
        } else {
            BookingEvent::Edited {
                template_id: template.id,
                side: template.side,
                edited_by: actor.id.clone(),
                kind: EditKind::SessionRemoved,
            }
        });
        self.gate_followups(&template, &instance, &admission, actor, &mut announcement);
        for w in self.announce(announcement).await {
            tracing::warn!(template = %template.id, "{w}");
        }
        Ok(template.status)
    }

    /// Cancel a booking. Once a reviewer has processed or confirmed it, a
    /// non-admin request only moves it to `pending_cancellation`.
    pub async fn cancel_booking(&self, actor: &Actor, template_id: Ulid) -> Result<BookingStatus, EngineError> {
        let (guard, mut template) = self.lock_template(template_id).await?;
        let now = self.clock.now();
        let status = match (template.status, actor.is_admin) {
            (s, _) if s.is_terminal() => None,
            (BookingStatus::PendingCancellation, false) => None,
            (BookingStatus::Processed | BookingStatus::Confirmed, false) => Some(BookingStatus::PendingCancellation),
            _ => Some(BookingStatus::Cancelled),
        };
        let Some(status) = status else {
            return Err(EngineError::InvalidState {
                id: template_id,
                status: template.status,
                action: "cancel",
            });
        };
        if template.locked && !actor.is_admin {
            return Err(EngineError::Locked(template_id));
        }

        template.status = status;
        template.last_edited_by = Some(actor.id.clone());
        template.last_edited_at = Some(now);
        self.store.update_template(&template).await?;
        drop(guard);

        tracing::info!(template = %template_id, status = status.as_str(), "cancellation by {}", actor.id);
        self.announce(Announcement {
            events: vec![BookingEvent::Cancelled {
                template_id,
                side: template.side,
                cancelled_by: actor.id.clone(),
                status,
            }],
            ..Announcement::default()
        })
        .await;
        Ok(status)
    }

    pub async fn confirm_booking(&self, actor: &Actor, template_id: Ulid) -> Result<BookingStatus, EngineError> {
        self.transition(
            actor,
            template_id,
            &[BookingStatus::Pending, BookingStatus::Processed],
            BookingStatus::Confirmed,
            "confirm",
        )
        .await
    }

    pub async fn complete_booking(&self, actor: &Actor, template_id: Ulid) -> Result<BookingStatus, EngineError> {
        self.transition(
            actor,
            template_id,
            &[BookingStatus::Processed, BookingStatus::Confirmed],
            BookingStatus::Completed,
            "complete",
        )
        .await
    }

    async fn transition(
        &self,
        actor: &Actor,
        template_id: Ulid,
        from: &[BookingStatus],
        to: BookingStatus,
        action: &'static str,
    ) -> Result<BookingStatus, EngineError> {
        if !actor.is_admin {
            return Err(EngineError::Forbidden("only admins can change booking status"));
        }
        let (guard, mut template) = self.lock_template(template_id).await?;
        if !from.contains(&template.status) {
            return Err(EngineError::InvalidState {
                id: template_id,
                status: template.status,
                action,
            });
        }
        template.status = to;
        self.store.update_template(&template).await?;
        drop(guard);
        self.notify.send(&BookingEvent::StatusChanged {
            template_id,
            side: template.side,
            status: to,
            by: actor.id.clone(),
        });
        Ok(to)
    }

    /// Reviewer sign-off: freeze the current occurrences as the snapshot
    /// later change reports compare against.
    pub async fn mark_processed(&self, actor: &Actor, template_id: Ulid) -> Result<ProcessedSnapshot, EngineError> {
        if !actor.is_admin {
            return Err(EngineError::Forbidden("only admins can process bookings"));
        }
        let (guard, mut template) = self.lock_template(template_id).await?;
        let now = self.clock.now();
        if template.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState {
                id: template_id,
                status: template.status,
                action: "process",
            });
        }
        let instances = self.store.instances_for_template(template_id).await?;
        let snapshot = ProcessedSnapshot::capture(template_id, &instances, &actor.id, now);
        self.store.put_snapshot(&snapshot).await?;

        template.status = BookingStatus::Processed;
        template.processed_by = Some(actor.id.clone());
        template.processed_at = Some(now);
        self.store.update_template(&template).await?;
        drop(guard);

        tracing::info!(template = %template_id, sessions = instances.len(), "processed by {}", actor.id);
        self.notify.send(&BookingEvent::Processed {
            template_id,
            side: template.side,
            processed_by: actor.id.clone(),
        });
        Ok(snapshot)
    }
}
