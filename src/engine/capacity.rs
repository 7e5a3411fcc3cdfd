use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::store::{BookingStore, StoreError};

/// A contiguous run inside one candidate where the athlete count is over the
/// period-type ceiling, or the period is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityViolation {
    pub at: Stamp,
    pub until: Stamp,
    /// Peak athletes over the run.
    pub used: u32,
    pub limit: u32,
    pub period: String,
    pub closed: bool,
    pub week: Option<WeekIndex>,
}

impl CapacityViolation {
    pub fn overage(&self) -> u32 {
        self.used.saturating_sub(self.limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    pub violations: Vec<CapacityViolation>,
    /// Some segment sits exactly at its ceiling.
    pub has_warnings: bool,
    pub max_used: u32,
    pub max_limit: u32,
}

impl CapacityReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn overage(&self) -> u32 {
        self.max_used.saturating_sub(self.max_limit)
    }

    /// Worst violation per week.
    pub fn peak_by_week(&self) -> BTreeMap<Option<WeekIndex>, &CapacityViolation> {
        let mut out: BTreeMap<Option<WeekIndex>, &CapacityViolation> = BTreeMap::new();
        for v in &self.violations {
            out.entry(v.week)
                .and_modify(|cur| {
                    if v.overage() > cur.overage() {
                        *cur = v;
                    }
                })
                .or_insert(v);
        }
        out
    }

    fn absorb(&mut self, violations: Vec<CapacityViolation>, warned: bool) {
        self.has_warnings |= warned;
        for v in violations {
            if self.violations.is_empty() || v.overage() > self.overage() {
                self.max_used = v.used;
                self.max_limit = v.limit;
            }
            self.violations.push(v);
        }
    }
}

impl fmt::Display for CapacityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity exceeded by {} athletes ({} booked, limit {}):",
            self.overage(),
            self.max_used,
            self.max_limit
        )?;
        for (week, v) in self.peak_by_week() {
            let when = format!(
                "{} {}–{}",
                v.at.format("%a %b %-d"),
                v.at.format("%H:%M"),
                v.until.format("%H:%M")
            );
            match week {
                Some(w) => write!(f, "\n  - Week {}, {when}: ", w + 1)?,
                None => write!(f, "\n  - {when}: ")?,
            }
            if v.closed {
                write!(f, "{} is closed to bookings", v.period)?;
            } else {
                write!(f, "{} athletes booked, {} limit {}", v.used, v.period, v.limit)?;
            }
        }
        Ok(())
    }
}

/// Sweep one candidate's span against everything else that overlaps it.
///
/// Segment edges are the start/end of every other instance clipped to the
/// candidate plus the schedule's block boundaries, so each segment has one
/// athlete count and resolves to one period type. Returns the merged
/// violations and whether any segment reached its ceiling exactly.
pub(crate) fn sweep_candidate<'a>(
    schedule: &CapacitySchedule,
    candidate: &BookingInstance,
    others: impl IntoIterator<Item = &'a BookingInstance>,
) -> (Vec<CapacityViolation>, bool) {
    let span = candidate.span;
    let mut deltas: BTreeMap<Stamp, i64> = BTreeMap::new();
    deltas.insert(span.start, 0);
    for other in others {
        if other.id == candidate.id || !other.span.overlaps(&span) {
            continue;
        }
        let s = other.span.start.max(span.start);
        let e = other.span.end.min(span.end);
        *deltas.entry(s).or_insert(0) += other.capacity as i64;
        if e < span.end {
            *deltas.entry(e).or_insert(0) -= other.capacity as i64;
        }
    }
    for b in schedule.boundaries_within(&span) {
        deltas.entry(b).or_insert(0);
    }

    let points: Vec<(Stamp, i64)> = deltas.into_iter().collect();
    let mut level = candidate.capacity as i64;
    let mut warned = false;
    let mut out: Vec<CapacityViolation> = Vec::new();

    for (i, &(at, delta)) in points.iter().enumerate() {
        level += delta;
        let until = points.get(i + 1).map(|p| p.0).unwrap_or(span.end);
        let Some(slot) = schedule.resolve(at) else {
            continue;
        };
        let used = level.max(0) as u32;
        if !slot.closed && used == slot.limit {
            warned = true;
        }
        if !slot.closed && used <= slot.limit {
            continue;
        }
        if let Some(last) = out.last_mut()
            && last.until == at
            && last.period == slot.period
        {
            last.until = until;
            last.used = last.used.max(used);
            continue;
        }
        out.push(CapacityViolation {
            at,
            until,
            used,
            limit: slot.limit,
            period: slot.period,
            closed: slot.closed,
            week: Some(candidate.week),
        });
    }
    (out, warned)
}

/// Pure check: each candidate against `existing` plus every other candidate.
pub fn check_capacity(
    schedule: &CapacitySchedule,
    candidates: &[BookingInstance],
    existing: &[BookingInstance],
) -> CapacityReport {
    let mut report = CapacityReport::default();
    for candidate in candidates {
        let (violations, warned) =
            sweep_candidate(schedule, candidate, existing.iter().chain(candidates.iter()));
        report.absorb(violations, warned);
    }
    report
}

/// Load the side's schedule and the live instances around every candidate,
/// then run [`check_capacity`].
pub(crate) async fn validate_capacity(
    store: &dyn BookingStore,
    side: Side,
    candidates: &[BookingInstance],
    exclude_template: Option<Ulid>,
) -> Result<CapacityReport, StoreError> {
    let schedule = store.capacity_schedule(side).await?.unwrap_or_default();
    let candidate_ids: HashSet<Ulid> = candidates.iter().map(|c| c.id).collect();
    let mut seen = HashSet::new();
    let mut existing = Vec::new();
    for candidate in candidates {
        for occ in store
            .overlapping_instances(side, candidate.span, exclude_template)
            .await?
        {
            // Edited instances are re-read from the store; the candidate wins.
            if candidate_ids.contains(&occ.instance.id) {
                continue;
            }
            if seen.insert(occ.instance.id) {
                existing.push(occ.instance);
            }
        }
    }
    Ok(check_capacity(&schedule, candidates, &existing))
}
