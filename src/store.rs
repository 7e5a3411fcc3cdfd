use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Storage-level (side, rack, span) exclusion would be violated.
    Exclusion {
        side: Side,
        rack: RackNumber,
        existing: Ulid,
        span: Span,
    },
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Exclusion { side, rack, existing, span } => write!(
                f,
                "{side} rack {rack} already held by instance {existing} during {span}"
            ),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// An existing occurrence together with its owning booking's title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupiedInstance {
    pub instance: BookingInstance,
    pub title: String,
}

/// The relational store the engine talks to.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert_template(&self, template: &BookingTemplate) -> Result<(), StoreError>;
    async fn update_template(&self, template: &BookingTemplate) -> Result<(), StoreError>;
    /// Deletes the template row and any instance rows it owns.
    async fn delete_template(&self, id: Ulid) -> Result<(), StoreError>;
    async fn get_template(&self, id: Ulid) -> Result<Option<BookingTemplate>, StoreError>;

    async fn insert_instances(&self, instances: &[BookingInstance]) -> Result<(), StoreError>;
    async fn update_instance(&self, instance: &BookingInstance) -> Result<(), StoreError>;
    async fn delete_instance(&self, id: Ulid) -> Result<(), StoreError>;
    async fn get_instance(&self, id: Ulid) -> Result<Option<BookingInstance>, StoreError>;
    async fn instances_for_template(&self, template_id: Ulid) -> Result<Vec<BookingInstance>, StoreError>;

    /// Same-side instances with `existing.start < span.end AND existing.end >
    /// span.start`, skipping `exclude_template` and templates that no longer
    /// hold racks.
    async fn overlapping_instances(
        &self,
        side: Side,
        span: Span,
        exclude_template: Option<Ulid>,
    ) -> Result<Vec<OccupiedInstance>, StoreError>;

    async fn capacity_schedule(&self, side: Side) -> Result<Option<CapacitySchedule>, StoreError>;
    async fn put_capacity_schedule(&self, side: Side, schedule: &CapacitySchedule) -> Result<(), StoreError>;

    async fn get_snapshot(&self, template_id: Ulid) -> Result<Option<ProcessedSnapshot>, StoreError>;
    async fn put_snapshot(&self, snapshot: &ProcessedSnapshot) -> Result<(), StoreError>;
}

/// The WAL record format: flat, one variant per row write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    TemplatePut(BookingTemplate),
    TemplateDeleted { id: Ulid },
    InstancesPut(Vec<BookingInstance>),
    InstanceDeleted { id: Ulid },
    SchedulePut { side: Side, schedule: CapacitySchedule },
    SnapshotPut(ProcessedSnapshot),
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: Ulid,
    template_id: Ulid,
    span: Span,
}

/// Per-side instance index, sorted by `span.start`.
#[derive(Debug, Default)]
struct SideIndex {
    entries: Vec<IndexEntry>,
}

impl SideIndex {
    fn insert(&mut self, entry: IndexEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, id: Ulid) -> Option<IndexEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Everything at index >= right_bound starts at or after `query.end`.
    fn overlapping(&self, query: &Span) -> impl Iterator<Item = &IndexEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

/// In-memory relational stand-in, optionally made durable by a WAL.
///
/// Instance writes enforce a (side, rack, span) exclusion constraint across
/// bookings so a racing second submission cannot double-book a rack even if
/// it slipped past the engine's checks.
pub struct InMemoryStore {
    templates: DashMap<Ulid, BookingTemplate>,
    instances: DashMap<Ulid, BookingInstance>,
    by_template: DashMap<Ulid, Vec<Ulid>>,
    sides: DashMap<Side, SideIndex>,
    schedules: DashMap<Side, CapacitySchedule>,
    snapshots: DashMap<Ulid, ProcessedSnapshot>,
    wal: Option<Mutex<Wal>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            instances: DashMap::new(),
            by_template: DashMap::new(),
            sides: DashMap::new(),
            schedules: DashMap::new(),
            snapshots: DashMap::new(),
            wal: None,
        }
    }

    /// Replay the WAL at `path` (if any) and keep appending to it.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let events = Wal::replay(path)?;
        let mut store = Self::new();
        for event in &events {
            store.apply(event);
        }
        store.wal = Some(Mutex::new(Wal::open(path)?));
        tracing::info!("replayed {} store events from {}", events.len(), path.display());
        Ok(store)
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// WAL-append + apply. The WAL lock is held across both so compaction
    /// never observes a logged-but-unapplied write.
    fn persist_and_apply(&self, event: StoreEvent) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else {
            self.apply(&event);
            return Ok(());
        };
        let mut wal = wal.lock().map_err(|_| StoreError::Io("WAL lock poisoned".into()))?;
        wal.append_buffered(&event)
            .and_then(|()| wal.flush_sync())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        self.apply(&event);
        Ok(())
    }

    pub fn wal_appends_since_compact(&self) -> u64 {
        self.wal
            .as_ref()
            .and_then(|w| w.lock().ok().map(|w| w.appends_since_compact()))
            .unwrap_or(0)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else { return Ok(()) };
        let mut wal = wal.lock().map_err(|_| StoreError::Io("WAL lock poisoned".into()))?;

        let mut events: Vec<StoreEvent> = Vec::new();
        for entry in self.schedules.iter() {
            events.push(StoreEvent::SchedulePut {
                side: *entry.key(),
                schedule: entry.value().clone(),
            });
        }
        for entry in self.templates.iter() {
            let template = entry.value().clone();
            let ids = self
                .by_template
                .get(&template.id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            let batch: Vec<BookingInstance> = ids
                .iter()
                .filter_map(|id| self.instances.get(id).map(|i| i.value().clone()))
                .collect();
            let snapshot = self.snapshots.get(&template.id).map(|s| s.value().clone());
            events.push(StoreEvent::TemplatePut(template));
            if !batch.is_empty() {
                events.push(StoreEvent::InstancesPut(batch));
            }
            if let Some(s) = snapshot {
                events.push(StoreEvent::SnapshotPut(s));
            }
        }

        let count = events.len();
        wal.compact(&events).map_err(|e| StoreError::Io(e.to_string()))?;
        tracing::info!("compacted store WAL to {count} events");
        Ok(())
    }

    /// Apply an event to the maps. No validation; callers check first.
    fn apply(&self, event: &StoreEvent) {
        match event {
            StoreEvent::TemplatePut(t) => {
                self.templates.insert(t.id, t.clone());
            }
            StoreEvent::TemplateDeleted { id } => {
                self.templates.remove(id);
                self.snapshots.remove(id);
                if let Some((_, ids)) = self.by_template.remove(id) {
                    for iid in ids {
                        self.drop_instance(iid);
                    }
                }
            }
            StoreEvent::InstancesPut(batch) => {
                for i in batch {
                    if let Some((_, old)) = self.instances.remove(&i.id) {
                        if let Some(mut idx) = self.sides.get_mut(&old.side) {
                            idx.remove(old.id);
                        }
                    } else {
                        self.by_template.entry(i.template_id).or_default().push(i.id);
                    }
                    self.sides.entry(i.side).or_default().insert(IndexEntry {
                        id: i.id,
                        template_id: i.template_id,
                        span: i.span,
                    });
                    self.instances.insert(i.id, i.clone());
                }
            }
            StoreEvent::InstanceDeleted { id } => {
                if let Some(tid) = self.instances.get(id).map(|i| i.template_id)
                    && let Some(mut ids) = self.by_template.get_mut(&tid)
                {
                    ids.retain(|x| x != id);
                }
                self.drop_instance(*id);
            }
            StoreEvent::SchedulePut { side, schedule } => {
                self.schedules.insert(*side, schedule.clone());
            }
            StoreEvent::SnapshotPut(s) => {
                self.snapshots.insert(s.template_id, s.clone());
            }
        }
    }

    fn drop_instance(&self, id: Ulid) {
        if let Some((_, old)) = self.instances.remove(&id)
            && let Some(mut idx) = self.sides.get_mut(&old.side)
        {
            idx.remove(id);
        }
    }

    fn holds_racks(&self, template_id: &Ulid) -> bool {
        self.templates
            .get(template_id)
            .is_some_and(|t| t.status.occupies_racks())
    }

    /// Exclusion check for a write of `candidate` against everything else on its side.
    fn check_exclusion(&self, candidate: &BookingInstance) -> Result<(), StoreError> {
        let hits: Vec<IndexEntry> = match self.sides.get(&candidate.side) {
            Some(idx) => idx
                .overlapping(&candidate.span)
                .filter(|e| e.template_id != candidate.template_id && e.id != candidate.id)
                .copied()
                .collect(),
            None => return Ok(()),
        };
        for hit in hits {
            if !self.holds_racks(&hit.template_id) {
                continue;
            }
            let Some(existing) = self.instances.get(&hit.id).map(|e| e.value().clone()) else {
                continue;
            };
            if let Some(&rack) = candidate.racks.iter().find(|r| existing.shares_rack(**r)) {
                return Err(StoreError::Exclusion {
                    side: candidate.side,
                    rack,
                    existing: existing.id,
                    span: existing.span,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn insert_template(&self, template: &BookingTemplate) -> Result<(), StoreError> {
        if self.templates.contains_key(&template.id) {
            return Err(StoreError::AlreadyExists(template.id));
        }
        self.persist_and_apply(StoreEvent::TemplatePut(template.clone()))
    }

    async fn update_template(&self, template: &BookingTemplate) -> Result<(), StoreError> {
        if !self.templates.contains_key(&template.id) {
            return Err(StoreError::NotFound(template.id));
        }
        self.persist_and_apply(StoreEvent::TemplatePut(template.clone()))
    }

    async fn delete_template(&self, id: Ulid) -> Result<(), StoreError> {
        if !self.templates.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(StoreEvent::TemplateDeleted { id })
    }

    async fn get_template(&self, id: Ulid) -> Result<Option<BookingTemplate>, StoreError> {
        Ok(self.templates.get(&id).map(|t| t.value().clone()))
    }

    async fn insert_instances(&self, instances: &[BookingInstance]) -> Result<(), StoreError> {
        for i in instances {
            if !self.templates.contains_key(&i.template_id) {
                return Err(StoreError::NotFound(i.template_id));
            }
            if self.instances.contains_key(&i.id) {
                return Err(StoreError::AlreadyExists(i.id));
            }
            self.check_exclusion(i)?;
        }
        self.persist_and_apply(StoreEvent::InstancesPut(instances.to_vec()))
    }

    async fn update_instance(&self, instance: &BookingInstance) -> Result<(), StoreError> {
        if !self.instances.contains_key(&instance.id) {
            return Err(StoreError::NotFound(instance.id));
        }
        self.check_exclusion(instance)?;
        self.persist_and_apply(StoreEvent::InstancesPut(vec![instance.clone()]))
    }

    async fn delete_instance(&self, id: Ulid) -> Result<(), StoreError> {
        if !self.instances.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(StoreEvent::InstanceDeleted { id })
    }

    async fn get_instance(&self, id: Ulid) -> Result<Option<BookingInstance>, StoreError> {
        Ok(self.instances.get(&id).map(|i| i.value().clone()))
    }

    async fn instances_for_template(&self, template_id: Ulid) -> Result<Vec<BookingInstance>, StoreError> {
        let ids = self
            .by_template
            .get(&template_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<BookingInstance> = ids
            .iter()
            .filter_map(|id| self.instances.get(id).map(|i| i.value().clone()))
            .collect();
        out.sort_by_key(|i| i.span.start);
        Ok(out)
    }

    async fn overlapping_instances(
        &self,
        side: Side,
        span: Span,
        exclude_template: Option<Ulid>,
    ) -> Result<Vec<OccupiedInstance>, StoreError> {
        let hits: Vec<IndexEntry> = match self.sides.get(&side) {
            Some(idx) => idx
                .overlapping(&span)
                .filter(|e| Some(e.template_id) != exclude_template)
                .copied()
                .collect(),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(title) = self
                .templates
                .get(&hit.template_id)
                .filter(|t| t.status.occupies_racks())
                .map(|t| t.title.clone())
            else {
                continue;
            };
            if let Some(instance) = self.instances.get(&hit.id).map(|i| i.value().clone()) {
                out.push(OccupiedInstance { instance, title });
            }
        }
        Ok(out)
    }

    async fn capacity_schedule(&self, side: Side) -> Result<Option<CapacitySchedule>, StoreError> {
        Ok(self.schedules.get(&side).map(|s| s.value().clone()))
    }

    async fn put_capacity_schedule(&self, side: Side, schedule: &CapacitySchedule) -> Result<(), StoreError> {
        self.persist_and_apply(StoreEvent::SchedulePut {
            side,
            schedule: schedule.clone(),
        })
    }

    async fn get_snapshot(&self, template_id: Ulid) -> Result<Option<ProcessedSnapshot>, StoreError> {
        Ok(self.snapshots.get(&template_id).map(|s| s.value().clone()))
    }

    async fn put_snapshot(&self, snapshot: &ProcessedSnapshot) -> Result<(), StoreError> {
        if !self.templates.contains_key(&snapshot.template_id) {
            return Err(StoreError::NotFound(snapshot.template_id));
        }
        self.persist_and_apply(StoreEvent::SnapshotPut(snapshot.clone()))
    }
}
