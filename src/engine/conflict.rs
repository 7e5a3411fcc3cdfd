use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::store::{BookingStore, OccupiedInstance, StoreError};

/// One requested rack already held by another booking in an overlapping window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub week: WeekIndex,
    pub rack: RackNumber,
    pub booking_title: String,
    pub conflicting_instance: Ulid,
    pub conflicting_span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub records: Vec<ConflictRecord>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Week → booking title → records.
    pub fn grouped(&self) -> BTreeMap<WeekIndex, BTreeMap<&str, Vec<&ConflictRecord>>> {
        let mut out: BTreeMap<WeekIndex, BTreeMap<&str, Vec<&ConflictRecord>>> = BTreeMap::new();
        for r in &self.records {
            out.entry(r.week)
                .or_default()
                .entry(r.booking_title.as_str())
                .or_default()
                .push(r);
        }
        out
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rack conflicts found:")?;
        for (week, by_title) in self.grouped() {
            write!(f, "\nWeek {}:", week + 1)?;
            for (title, records) in by_title {
                // Same booking may clash on several instances in one week.
                let mut spans: Vec<Span> = records.iter().map(|r| r.conflicting_span).collect();
                spans.sort_by_key(|s| s.start);
                spans.dedup();
                let mut racks: Vec<RackNumber> = records.iter().map(|r| r.rack).collect();
                racks.sort_unstable();
                racks.dedup();
                let racks = racks.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ");
                let when = spans.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ");
                write!(f, "\n  - {title} ({when}): rack {racks}")?;
            }
        }
        Ok(())
    }
}

/// Records for `candidate` against already-fetched overlapping instances.
/// Every holder of a requested rack is reported.
pub(crate) fn conflicts_for(candidate: &BookingInstance, existing: &[OccupiedInstance]) -> Vec<ConflictRecord> {
    let mut out = Vec::new();
    for &rack in &candidate.racks {
        for occ in existing {
            if occ.instance.span.overlaps(&candidate.span) && occ.instance.shares_rack(rack) {
                out.push(ConflictRecord {
                    week: candidate.week,
                    rack,
                    booking_title: occ.title.clone(),
                    conflicting_instance: occ.instance.id,
                    conflicting_span: occ.instance.span,
                });
            }
        }
    }
    out
}

/// Check every candidate against the store, one week at a time.
pub(crate) async fn detect_conflicts(
    store: &dyn BookingStore,
    side: Side,
    candidates: &[BookingInstance],
    exclude_template: Option<Ulid>,
) -> Result<ConflictReport, StoreError> {
    let mut report = ConflictReport::default();
    for candidate in candidates {
        let existing = store
            .overlapping_instances(side, candidate.span, exclude_template)
            .await?;
        report.records.extend(conflicts_for(candidate, &existing));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn inst(week: WeekIndex, span: Span, racks: Vec<RackNumber>) -> BookingInstance {
        BookingInstance {
            id: Ulid::new(),
            template_id: Ulid::new(),
            side: Side::Power,
            week,
            span,
            racks,
            areas: vec![],
            capacity: 1,
        }
    }

    fn occ(title: &str, span: Span, racks: Vec<RackNumber>) -> OccupiedInstance {
        OccupiedInstance {
            instance: inst(0, span, racks),
            title: title.into(),
        }
    }

    #[test]
    fn no_shared_rack_no_conflict() {
        let span = Span::new(at(3, 9, 0), at(3, 10, 0));
        let cand = inst(0, span, vec![1, 2]);
        let existing = vec![occ("Rowing", span, vec![3, 4])];
        assert!(conflicts_for(&cand, &existing).is_empty());
    }

    #[test]
    fn adjacent_window_no_conflict() {
        let cand = inst(0, Span::new(at(3, 9, 0), at(3, 10, 0)), vec![1]);
        let existing = vec![occ("Rowing", Span::new(at(3, 10, 0), at(3, 11, 0)), vec![1])];
        assert!(conflicts_for(&cand, &existing).is_empty());
    }

    #[test]
    fn shared_rack_reported_with_week() {
        let cand = inst(2, Span::new(at(17, 9, 0), at(17, 10, 0)), vec![1, 2]);
        let existing = vec![occ("Rowing", Span::new(at(17, 9, 30), at(17, 11, 0)), vec![2, 5])];
        let records = conflicts_for(&cand, &existing);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].week, 2);
        assert_eq!(records[0].rack, 2);
        assert_eq!(records[0].booking_title, "Rowing");
    }

    #[test]
    fn every_holder_reported() {
        let span = Span::new(at(3, 9, 0), at(3, 10, 0));
        let cand = inst(0, span, vec![4]);
        let existing = vec![occ("Rowing", span, vec![4]), occ("Legacy dup", span, vec![4])];
        let records = conflicts_for(&cand, &existing);
        assert_eq!(records.len(), 2);
        let report = ConflictReport { records };
        let grouped = report.grouped();
        assert_eq!(grouped[&0].len(), 2);
    }

    #[test]
    fn report_message_groups_by_week_then_title() {
        let span = Span::new(at(3, 9, 0), at(3, 10, 0));
        let later = span.shifted(chrono::Duration::weeks(1));
        let mut records = conflicts_for(&inst(0, span, vec![1, 2]), &[occ("Rowing", span, vec![1, 2])]);
        records.extend(conflicts_for(&inst(1, later, vec![1]), &[occ("Throws", later, vec![1])]));
        let msg = ConflictReport { records }.to_string();
        assert_eq!(
            msg,
            "rack conflicts found:\nWeek 1:\n  - Rowing (Mon Mar 3 09:00–10:00): rack 1, 2\
             \nWeek 2:\n  - Throws (Mon Mar 10 09:00–10:00): rack 1"
        );
    }
}
