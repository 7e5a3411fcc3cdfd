use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::diff::{diff, ChangeReport, SnapshotTier};
use super::{Engine, EngineError};

/// A booking with its live occurrences, sorted by start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub template: BookingTemplate,
    pub instances: Vec<BookingInstance>,
}

impl Engine {
    pub async fn get_booking(&self, template_id: Ulid) -> Result<BookingView, EngineError> {
        let template = self.load_template(template_id).await?;
        let instances = self.store.instances_for_template(template_id).await?;
        Ok(BookingView { template, instances })
    }

    /// What changed since the booking was last processed. A booking that was
    /// never processed has nothing to compare against.
    pub async fn change_report(&self, template_id: Ulid) -> Result<ChangeReport, EngineError> {
        self.load_template(template_id).await?;
        let Some(snapshot) = self.store.get_snapshot(template_id).await? else {
            return Ok(ChangeReport {
                tier: SnapshotTier::PerInstance,
                changes: Vec::new(),
            });
        };
        let current = self.store.instances_for_template(template_id).await?;
        Ok(diff(&snapshot, &current, self.settings.legacy_tolerance))
    }

    pub async fn capacity_schedule(&self, side: Side) -> Result<CapacitySchedule, EngineError> {
        Ok(self.store.capacity_schedule(side).await?.unwrap_or_default())
    }

    /// Replace a side's schedule wholesale.
    pub async fn set_capacity_schedule(
        &self,
        actor: &Actor,
        side: Side,
        schedule: CapacitySchedule,
    ) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::Forbidden("only admins can change the capacity schedule"));
        }
        let problems = schedule.problems();
        if !problems.is_empty() {
            return Err(EngineError::Validation(problems));
        }
        let _guard = self.side_lock(side).lock().await;
        self.store.put_capacity_schedule(side, &schedule).await?;
        tracing::info!(side = %side, periods = schedule.periods.len(), "capacity schedule replaced by {}", actor.id);
        Ok(())
    }
}
