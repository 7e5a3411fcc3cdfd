use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Extended,
    SessionsRemoved,
    Capacity,
    Time,
    Racks,
}

/// One category of change since processing. Recomputed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub title: String,
    /// One line per affected date.
    pub details: Vec<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Which snapshot data the report was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTier {
    /// Every original occurrence was captured; matching is exact by date.
    PerInstance,
    /// Only the first occurrence was captured; removals are projected and
    /// per-instance values assumed uniform.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    pub tier: SnapshotTier,
    pub changes: Vec<Change>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn day(t: Stamp) -> String {
    t.format("%a %b %-d").to_string()
}

fn hhmm(start: Stamp, end: Stamp) -> String {
    format!("{}–{}", start.format("%H:%M"), end.format("%H:%M"))
}

fn rack_list(racks: &[RackNumber]) -> String {
    let set: BTreeSet<_> = racks.iter().collect();
    set.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Snapshot occurrence paired with the live one it is compared against.
type Pair<'a> = (&'a InstanceSnapshot, &'a BookingInstance);

fn pairs<'a>(snapshot: &'a ProcessedSnapshot, current: &'a [BookingInstance]) -> Vec<Pair<'a>> {
    match (&snapshot.instances, &snapshot.first) {
        (Some(all), _) => current
            .iter()
            .filter_map(|c| {
                all.iter()
                    .find(|s| s.start.date() == c.span.start.date())
                    .map(|s| (s, c))
            })
            .collect(),
        (None, Some(first)) => current
            .iter()
            .take(snapshot.instance_count)
            .map(|c| (first, c))
            .collect(),
        (None, None) => Vec::new(),
    }
}

fn removed_dates(snapshot: &ProcessedSnapshot, current: &[BookingInstance], tolerance: Duration) -> Vec<NaiveDate> {
    if let Some(all) = &snapshot.instances {
        let live: BTreeSet<NaiveDate> = current.iter().map(|c| c.span.start.date()).collect();
        let mut out: Vec<NaiveDate> = all
            .iter()
            .map(|s| s.start.date())
            .filter(|d| !live.contains(d))
            .collect();
        out.dedup();
        return out;
    }
    let Some(first) = &snapshot.first else {
        return Vec::new();
    };
    let step = match current {
        [a, b, ..] if b.span.start > a.span.start => b.span.start - a.span.start,
        _ => Duration::days(7),
    };
    (0..snapshot.instance_count)
        .map_while(|k| {
            let k = i32::try_from(k).ok()?;
            first.start.checked_add_signed(step.checked_mul(k)?)
        })
        .filter(|expected| {
            !current
                .iter()
                .any(|c| (c.span.start - *expected).abs() <= tolerance)
        })
        .map(|t| t.date())
        .collect()
}

/// Compare a processed snapshot against the live occurrences of the same
/// booking. Pure; identical inputs give identical output.
pub fn diff(snapshot: &ProcessedSnapshot, current: &[BookingInstance], tolerance: Duration) -> ChangeReport {
    let tier = if snapshot.instances.is_some() {
        SnapshotTier::PerInstance
    } else {
        SnapshotTier::Legacy
    };
    let mut report = ChangeReport { tier, changes: Vec::new() };
    if snapshot.is_empty() || snapshot.processed_at.is_none() {
        return report;
    }

    let mut current: Vec<BookingInstance> = current.to_vec();
    current.sort_by_key(|c| c.span.start);
    let was = snapshot.instance_count;
    let now = current.len();

    if now > was {
        let added = &current[was..];
        report.changes.push(Change {
            kind: ChangeKind::Extended,
            title: format!("Extended by {} session{}", added.len(), plural(added.len())),
            details: added.iter().map(|c| c.span.to_string()).collect(),
            old_value: Some(was.to_string()),
            new_value: Some(now.to_string()),
        });
    }

    if now < was {
        let removed = removed_dates(snapshot, &current, tolerance);
        let n = if removed.is_empty() { was - now } else { removed.len() };
        report.changes.push(Change {
            kind: ChangeKind::SessionsRemoved,
            title: format!("{n} session{} removed", plural(n)),
            details: removed.iter().map(|d| d.format("%a %b %-d").to_string()).collect(),
            old_value: Some(was.to_string()),
            new_value: Some(now.to_string()),
        });
    }

    let matched = pairs(snapshot, &current);

    let capacity: Vec<Pair> = matched.iter().copied().filter(|(s, c)| s.capacity != c.capacity).collect();
    if !capacity.is_empty() {
        let new_values: BTreeSet<u32> = capacity.iter().map(|(_, c)| c.capacity).collect();
        let old_values: BTreeSet<u32> = capacity.iter().map(|(s, _)| s.capacity).collect();
        let uniform = new_values.len() == 1;
        let title = if uniform {
            format!("Athlete count changed to {}", capacity[0].1.capacity)
        } else {
            format!("Athlete count changed on {} sessions", capacity.len())
        };
        report.changes.push(Change {
            kind: ChangeKind::Capacity,
            title,
            details: capacity
                .iter()
                .map(|(s, c)| format!("{}: {} → {}", day(c.span.start), s.capacity, c.capacity))
                .collect(),
            old_value: (old_values.len() == 1).then(|| capacity[0].0.capacity.to_string()),
            new_value: uniform.then(|| capacity[0].1.capacity.to_string()),
        });
    }

    let time: Vec<Pair> = matched
        .iter()
        .copied()
        .filter(|(s, c)| hhmm(s.start, s.end) != hhmm(c.span.start, c.span.end))
        .collect();
    if !time.is_empty() {
        let new_values: BTreeSet<String> = time.iter().map(|(_, c)| hhmm(c.span.start, c.span.end)).collect();
        let old_values: BTreeSet<String> = time.iter().map(|(s, _)| hhmm(s.start, s.end)).collect();
        let uniform = new_values.len() == 1;
        let title = match new_values.iter().next() {
            Some(v) if uniform => format!("Session times changed to {v}"),
            _ => format!("Session times changed on {} sessions", time.len()),
        };
        report.changes.push(Change {
            kind: ChangeKind::Time,
            title,
            details: time
                .iter()
                .map(|(s, c)| {
                    format!(
                        "{}: {} → {}",
                        day(c.span.start),
                        hhmm(s.start, s.end),
                        hhmm(c.span.start, c.span.end)
                    )
                })
                .collect(),
            old_value: (old_values.len() == 1).then(|| old_values.into_iter().next()).flatten(),
            new_value: if uniform { new_values.into_iter().next() } else { None },
        });
    }

    let racks: Vec<Pair> = matched
        .iter()
        .copied()
        .filter(|(s, c)| {
            let a: BTreeSet<_> = s.racks.iter().collect();
            let b: BTreeSet<_> = c.racks.iter().collect();
            a != b
        })
        .collect();
    if !racks.is_empty() {
        report.changes.push(Change {
            kind: ChangeKind::Racks,
            title: format!("Racks changed on {} session{}", racks.len(), plural(racks.len())),
            details: racks
                .iter()
                .map(|(s, c)| format!("{}: {} → {}", day(c.span.start), rack_list(&s.racks), rack_list(&c.racks)))
                .collect(),
            old_value: None,
            new_value: None,
        });
    }

    report
}
