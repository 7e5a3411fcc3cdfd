use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Facility-local wall-clock time. The only time type.
pub type Stamp = NaiveDateTime;

/// Side-scoped rack/platform number, starting at 1.
pub type RackNumber = u16;

/// Zero-based week offset from a template's first session.
pub type WeekIndex = u32;

/// One of the two independent facility areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Power,
    Base,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Power, Side::Base];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Power => "power",
            Side::Base => "base",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Power => f.write_str("Power"),
            Side::Base => f.write_str("Base"),
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Stamp,
    pub end: Stamp,
}

impl Span {
    pub fn new(start: Stamp, end: Stamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Stamp) -> bool {
        self.start <= t && t < self.end
    }

    pub fn shifted(&self, by: chrono::Duration) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}–{}",
            self.start.format("%a %b %-d"),
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Draft,
    Pending,
    PendingCancellation,
    Processed,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// Whether instances of a template in this status still hold their racks.
    pub fn occupies_racks(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Draft)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Draft => "draft",
            BookingStatus::Pending => "pending",
            BookingStatus::PendingCancellation => "pending_cancellation",
            BookingStatus::Processed => "processed",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// The user-authored recurring booking definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingTemplate {
    pub id: Ulid,
    pub side: Side,
    pub title: String,
    /// First session; later weeks are offsets of this span.
    pub first: Span,
    pub week_count: u32,
    pub racks_by_week: BTreeMap<WeekIndex, Vec<RackNumber>>,
    pub capacity_by_week: BTreeMap<WeekIndex, u32>,
    pub default_capacity: u32,
    pub areas: Vec<String>,
    pub locked: bool,
    pub status: BookingStatus,
    pub created_by: String,
    pub created_at: Stamp,
    pub last_edited_by: Option<String>,
    pub last_edited_at: Option<Stamp>,
    pub processed_by: Option<String>,
    pub processed_at: Option<Stamp>,
    pub last_minute_change: bool,
    pub cutoff_at: Option<Stamp>,
    pub override_by: Option<String>,
    pub override_reason: Option<String>,
}

impl BookingTemplate {
    pub fn racks_for_week(&self, week: WeekIndex) -> &[RackNumber] {
        self.racks_by_week.get(&week).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn capacity_for_week(&self, week: WeekIndex) -> u32 {
        self.capacity_by_week
            .get(&week)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// Record an edit; a processed booking re-enters review.
    pub fn touch_edit(&mut self, actor: &Actor, now: Stamp) {
        self.last_edited_by = Some(actor.id.clone());
        self.last_edited_at = Some(now);
        if self.status == BookingStatus::Processed {
            self.status = BookingStatus::Pending;
        }
    }
}

/// One concrete dated occurrence of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingInstance {
    pub id: Ulid,
    pub template_id: Ulid,
    pub side: Side,
    pub week: WeekIndex,
    pub span: Span,
    pub racks: Vec<RackNumber>,
    pub areas: Vec<String>,
    pub capacity: u32,
}

impl BookingInstance {
    pub fn shares_rack(&self, rack: RackNumber) -> bool {
        self.racks.contains(&rack)
    }
}

/// Frozen values of one occurrence at processing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub start: Stamp,
    pub end: Stamp,
    pub capacity: u32,
    pub racks: Vec<RackNumber>,
}

impl From<&BookingInstance> for InstanceSnapshot {
    fn from(i: &BookingInstance) -> Self {
        Self {
            start: i.span.start,
            end: i.span.end,
            capacity: i.capacity,
            racks: i.racks.clone(),
        }
    }
}

/// State of a booking captured when a reviewer marked it processed.
///
/// Older snapshots only carry `first`; `instances` is present for anything
/// captured by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedSnapshot {
    pub template_id: Ulid,
    pub processed_at: Option<Stamp>,
    pub processed_by: Option<String>,
    pub instance_count: usize,
    pub first: Option<InstanceSnapshot>,
    #[serde(default)]
    pub instances: Option<Vec<InstanceSnapshot>>,
}

impl ProcessedSnapshot {
    /// Capture every occurrence, sorted by start.
    pub fn capture(
        template_id: Ulid,
        instances: &[BookingInstance],
        processed_by: &str,
        processed_at: Stamp,
    ) -> Self {
        let mut all: Vec<InstanceSnapshot> = instances.iter().map(InstanceSnapshot::from).collect();
        all.sort_by_key(|s| s.start);
        Self {
            template_id,
            processed_at: Some(processed_at),
            processed_by: Some(processed_by.to_string()),
            instance_count: all.len(),
            first: all.first().cloned(),
            instances: Some(all),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance_count == 0
            && self.first.is_none()
            && self.instances.as_ref().is_none_or(Vec::is_empty)
    }
}

// ── Capacity schedule ────────────────────────────────────────────

/// A named capacity regime, e.g. "Performance" or "Closed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodType {
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub closed: bool,
}

/// Recurring weekly assignment of a period type to a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyBlock {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub period: String,
}

/// Assignment for one specific date. Any dated block on a date replaces all
/// weekly blocks for that date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatedBlock {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub period: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityOverride {
    pub date: NaiveDate,
    pub period: String,
    pub capacity: u32,
}

/// What a single instant resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLimit {
    pub period: String,
    pub limit: u32,
    pub closed: bool,
}

/// Per-side period-type capacity schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySchedule {
    pub periods: Vec<PeriodType>,
    #[serde(default)]
    pub weekly: Vec<WeeklyBlock>,
    #[serde(default)]
    pub dated: Vec<DatedBlock>,
    #[serde(default)]
    pub overrides: Vec<CapacityOverride>,
}

impl CapacitySchedule {
    /// Structural problems, one line each. Empty means usable.
    pub fn problems(&self) -> Vec<String> {
        use crate::limits::*;
        let mut out = Vec::new();
        if self.periods.len() > MAX_PERIOD_TYPES {
            out.push(format!("at most {MAX_PERIOD_TYPES} period types"));
        }
        if self.weekly.len() + self.dated.len() > MAX_SCHEDULE_BLOCKS {
            out.push(format!("at most {MAX_SCHEDULE_BLOCKS} schedule blocks"));
        }
        for (i, p) in self.periods.iter().enumerate() {
            if self.periods[..i].iter().any(|q| q.name == p.name) {
                out.push(format!("duplicate period type '{}'", p.name));
            }
        }
        let known = |name: &str| self.periods.iter().any(|p| p.name == name);
        for b in &self.weekly {
            if b.start >= b.end {
                out.push(format!("{:?} block {}–{} is empty", b.weekday, b.start, b.end));
            }
            if !known(&b.period) {
                out.push(format!("unknown period type '{}'", b.period));
            }
        }
        for b in &self.dated {
            if b.start >= b.end {
                out.push(format!("{} block {}–{} is empty", b.date, b.start, b.end));
            }
            if !known(&b.period) {
                out.push(format!("unknown period type '{}'", b.period));
            }
        }
        for o in &self.overrides {
            if !known(&o.period) {
                out.push(format!("override for unknown period type '{}'", o.period));
            }
        }
        out
    }

    /// Blocks in force on `date`: the dated ones if any exist, else the weekly ones.
    fn blocks_on(&self, date: NaiveDate) -> Vec<(NaiveTime, NaiveTime, &str)> {
        let dated: Vec<_> = self
            .dated
            .iter()
            .filter(|b| b.date == date)
            .map(|b| (b.start, b.end, b.period.as_str()))
            .collect();
        if !dated.is_empty() {
            return dated;
        }
        self.weekly
            .iter()
            .filter(|b| b.weekday == date.weekday())
            .map(|b| (b.start, b.end, b.period.as_str()))
            .collect()
    }

    /// Resolve the period type and ceiling at `at`. `None` means no block
    /// covers the instant and it is unconstrained.
    pub fn resolve(&self, at: Stamp) -> Option<SlotLimit> {
        let date = at.date();
        let time = at.time();
        let (_, _, name) = self
            .blocks_on(date)
            .into_iter()
            .find(|(s, e, _)| *s <= time && time < *e)?;
        let period = self.periods.iter().find(|p| p.name == name)?;
        let limit = self
            .overrides
            .iter()
            .find(|o| o.date == date && o.period == period.name)
            .map(|o| o.capacity)
            .unwrap_or(period.capacity);
        Some(SlotLimit {
            period: period.name.clone(),
            limit: if period.closed { 0 } else { limit },
            closed: period.closed,
        })
    }

    /// Block boundaries strictly inside `span`, sorted.
    pub fn boundaries_within(&self, span: &Span) -> Vec<Stamp> {
        let mut out = Vec::new();
        let mut date = span.start.date();
        while date <= span.end.date() {
            for (s, e, _) in self.blocks_on(date) {
                for t in [date.and_time(s), date.and_time(e)] {
                    if span.start < t && t < span.end {
                        out.push(t);
                    }
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule() -> CapacitySchedule {
        CapacitySchedule {
            periods: vec![
                PeriodType { name: "Performance".into(), capacity: 20, closed: false },
                PeriodType { name: "General User".into(), capacity: 40, closed: false },
                PeriodType { name: "Closed".into(), capacity: 0, closed: true },
            ],
            weekly: vec![
                WeeklyBlock { weekday: Weekday::Mon, start: t(6, 0), end: t(12, 0), period: "Performance".into() },
                WeeklyBlock { weekday: Weekday::Mon, start: t(12, 0), end: t(22, 0), period: "General User".into() },
            ],
            dated: vec![DatedBlock {
                date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                start: t(0, 0),
                end: t(23, 59),
                period: "Closed".into(),
            }],
            overrides: vec![CapacityOverride {
                date: NaiveDate::from_ymd_opt(2025, 3, 17).unwrap(),
                period: "Performance".into(),
                capacity: 12,
            }],
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(at(3, 9, 0), at(3, 10, 0));
        assert_eq!(s.duration(), chrono::Duration::hours(1));
        assert!(s.contains_instant(at(3, 9, 0)));
        assert!(!s.contains_instant(at(3, 10, 0))); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(at(3, 9, 0), at(3, 10, 0));
        let b = Span::new(at(3, 9, 30), at(3, 11, 0));
        let c = Span::new(at(3, 10, 0), at(3, 11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_display() {
        let s = Span::new(at(3, 9, 0), at(3, 10, 30));
        assert_eq!(s.to_string(), "Mon Mar 3 09:00–10:30");
    }

    #[test]
    fn touch_edit_resets_processed() {
        let mut tpl = BookingTemplate {
            id: Ulid::new(),
            side: Side::Power,
            title: "Squad".into(),
            first: Span::new(at(3, 9, 0), at(3, 10, 0)),
            week_count: 1,
            racks_by_week: BTreeMap::from([(0, vec![1])]),
            capacity_by_week: BTreeMap::new(),
            default_capacity: 1,
            areas: vec![],
            locked: false,
            status: BookingStatus::Processed,
            created_by: "coach".into(),
            created_at: at(1, 8, 0),
            last_edited_by: None,
            last_edited_at: None,
            processed_by: Some("admin".into()),
            processed_at: Some(at(2, 8, 0)),
            last_minute_change: false,
            cutoff_at: None,
            override_by: None,
            override_reason: None,
        };
        let actor = Actor { id: "coach".into(), name: "Coach".into(), is_admin: false };
        tpl.touch_edit(&actor, at(2, 9, 0));
        assert_eq!(tpl.status, BookingStatus::Pending);
        assert_eq!(tpl.last_edited_by.as_deref(), Some("coach"));
        assert_eq!(tpl.last_edited_at, Some(at(2, 9, 0)));
        assert_eq!(tpl.capacity_for_week(0), 1);
        assert_eq!(tpl.racks_for_week(3), &[] as &[RackNumber]);
    }

    #[test]
    fn schedule_resolves_weekly_blocks() {
        let s = schedule();
        let slot = s.resolve(at(3, 7, 0)).unwrap();
        assert_eq!(slot.period, "Performance");
        assert_eq!(slot.limit, 20);
        let slot = s.resolve(at(3, 12, 0)).unwrap();
        assert_eq!(slot.period, "General User");
        assert!(s.resolve(at(3, 23, 0)).is_none());
        assert!(s.resolve(at(4, 7, 0)).is_none()); // Tuesday has no blocks
    }

    #[test]
    fn schedule_dated_block_replaces_weekly() {
        let s = schedule();
        let slot = s.resolve(at(10, 7, 0)).unwrap();
        assert!(slot.closed);
        assert_eq!(slot.limit, 0);
    }

    #[test]
    fn schedule_capacity_override() {
        let s = schedule();
        assert_eq!(s.resolve(at(17, 7, 0)).unwrap().limit, 12);
        assert_eq!(s.resolve(at(24, 7, 0)).unwrap().limit, 20);
    }

    #[test]
    fn schedule_boundaries_inside_span() {
        let s = schedule();
        let span = Span::new(at(3, 11, 0), at(3, 13, 0));
        assert_eq!(s.boundaries_within(&span), vec![at(3, 12, 0)]);
        let edge = Span::new(at(3, 12, 0), at(3, 13, 0));
        assert!(s.boundaries_within(&edge).is_empty());
    }

    #[test]
    fn schedule_problems() {
        let mut s = schedule();
        assert!(s.problems().is_empty());
        s.weekly.push(WeeklyBlock { weekday: Weekday::Tue, start: t(9, 0), end: t(8, 0), period: "Nope".into() });
        let problems = s.problems();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn snapshot_capture_sorts_and_counts() {
        let tid = Ulid::new();
        let mk = |d: u32, cap: u32| BookingInstance {
            id: Ulid::new(),
            template_id: tid,
            side: Side::Base,
            week: 0,
            span: Span::new(at(d, 9, 0), at(d, 10, 0)),
            racks: vec![2, 1],
            areas: vec![],
            capacity: cap,
        };
        let snap = ProcessedSnapshot::capture(tid, &[mk(10, 5), mk(3, 4)], "admin", at(1, 0, 0));
        assert_eq!(snap.instance_count, 2);
        assert_eq!(snap.first.as_ref().unwrap().capacity, 4);
        assert_eq!(snap.instances.as_ref().unwrap()[1].capacity, 5);
        assert!(!snap.is_empty());
    }
}
