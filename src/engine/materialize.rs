use std::collections::HashSet;
use std::ops::Range;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Problems with a rack list, phrased for week `week` (zero-based).
pub(crate) fn rack_problems(week: WeekIndex, racks: &[RackNumber]) -> Vec<String> {
    let label = week + 1;
    let mut out = Vec::new();
    if racks.is_empty() {
        out.push(format!("Week {label} has no racks assigned"));
        return out;
    }
    let mut seen = HashSet::new();
    for &r in racks {
        if r == 0 || r > MAX_RACK_NUMBER {
            out.push(format!("Week {label}: rack {r} does not exist"));
        }
        if !seen.insert(r) {
            out.push(format!("Week {label}: rack {r} listed twice"));
        }
    }
    out
}

pub(crate) fn capacity_problem(week: WeekIndex, capacity: u32) -> Option<String> {
    if capacity == 0 {
        Some(format!("Week {}: athlete count must be at least 1", week + 1))
    } else if capacity > MAX_CAPACITY {
        Some(format!("Week {}: athlete count above {MAX_CAPACITY}", week + 1))
    } else {
        None
    }
}

pub(crate) fn span_problem(span: &Span) -> Option<String> {
    if span.end <= span.start {
        Some("end time must be after start time".into())
    } else if span.duration() > chrono::Duration::hours(MAX_SESSION_HOURS) {
        Some(format!("sessions are limited to {MAX_SESSION_HOURS} hours"))
    } else {
        None
    }
}

/// Check everything about a template that does not need the store.
/// `end <= start` short-circuits; otherwise every problem is collected.
pub fn validate_template(template: &BookingTemplate) -> Result<(), EngineError> {
    if template.first.end <= template.first.start {
        return Err(EngineError::Validation(vec![
            "end time must be after start time".into(),
        ]));
    }

    let mut problems = Vec::new();
    if let Some(p) = span_problem(&template.first) {
        problems.push(p);
    }
    if template.title.trim().is_empty() {
        problems.push("title is required".into());
    } else if template.title.len() > MAX_TITLE_LEN {
        problems.push(format!("title longer than {MAX_TITLE_LEN} characters"));
    }
    if template.areas.len() > MAX_AREA_TAGS {
        problems.push(format!("at most {MAX_AREA_TAGS} area tags"));
    }
    if template.areas.iter().any(|a| a.len() > MAX_AREA_TAG_LEN) {
        problems.push(format!("area tags are limited to {MAX_AREA_TAG_LEN} characters"));
    }
    if template.week_count == 0 {
        problems.push("at least one week is required".into());
    } else if template.week_count > MAX_WEEKS {
        problems.push(format!("at most {MAX_WEEKS} weeks"));
    }
    if let Some(p) = capacity_problem(0, template.default_capacity) {
        problems.push(p.replacen("Week 1", "Default", 1));
    }

    let weeks = template.week_count.min(MAX_WEEKS);
    for week in 0..weeks {
        problems.extend(rack_problems(week, template.racks_for_week(week)));
        if let Some(&cap) = template.capacity_by_week.get(&week)
            && let Some(p) = capacity_problem(week, cap)
        {
            problems.push(p);
        }
    }
    for &week in template.racks_by_week.keys().chain(template.capacity_by_week.keys()) {
        if week >= template.week_count {
            problems.push(format!(
                "Week {} is beyond the booking's {} weeks",
                week + 1,
                template.week_count
            ));
        }
    }
    problems.dedup();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(problems))
    }
}

/// Expand `weeks` of a template into concrete occurrences: week *i* is the
/// first session shifted by `7 * i` days.
pub fn materialize_weeks(template: &BookingTemplate, weeks: Range<WeekIndex>) -> Vec<BookingInstance> {
    weeks
        .map(|week| BookingInstance {
            id: Ulid::new(),
            template_id: template.id,
            side: template.side,
            week,
            span: template.first.shifted(chrono::Duration::weeks(week as i64)),
            racks: template.racks_for_week(week).to_vec(),
            areas: template.areas.clone(),
            capacity: template.capacity_for_week(week),
        })
        .collect()
}

/// Validate and expand the whole template into exactly `week_count` instances.
pub fn materialize(template: &BookingTemplate) -> Result<Vec<BookingInstance>, EngineError> {
    validate_template(template)?;
    Ok(materialize_weeks(template, 0..template.week_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{Duration, NaiveDate};

    fn at(d: u32, h: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn template(weeks: u32) -> BookingTemplate {
        BookingTemplate {
            id: Ulid::new(),
            side: Side::Power,
            title: "Sprint squad".into(),
            first: Span::new(at(3, 16), at(3, 18)),
            week_count: weeks,
            racks_by_week: (0..weeks).map(|w| (w, vec![1, 2])).collect(),
            capacity_by_week: BTreeMap::new(),
            default_capacity: 4,
            areas: vec!["platform".into()],
            locked: false,
            status: BookingStatus::Pending,
            created_by: "coach".into(),
            created_at: at(1, 8),
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

    #[test]
    fn produces_one_instance_per_week() {
        for weeks in [1, 2, 5, MAX_WEEKS] {
            let tpl = template(weeks);
            let out = materialize(&tpl).unwrap();
            assert_eq!(out.len(), weeks as usize);
            for (i, inst) in out.iter().enumerate() {
                let offset = Duration::days(7 * i as i64);
                assert_eq!(inst.span.start, tpl.first.start + offset);
                assert_eq!(inst.span.end, tpl.first.end + offset);
                assert_eq!(inst.week, i as u32);
                assert_eq!(inst.template_id, tpl.id);
            }
        }
    }

    #[test]
    fn per_week_overrides_apply() {
        let mut tpl = template(3);
        tpl.racks_by_week.insert(1, vec![7]);
        tpl.capacity_by_week.insert(2, 9);
        let out = materialize(&tpl).unwrap();
        assert_eq!(out[0].racks, vec![1, 2]);
        assert_eq!(out[1].racks, vec![7]);
        assert_eq!(out[0].capacity, 4);
        assert_eq!(out[2].capacity, 9);
        assert_eq!(out[2].areas, vec!["platform".to_string()]);
    }

    #[test]
    fn end_before_start_rejected_alone() {
        let mut tpl = template(2);
        tpl.first = Span { start: at(3, 18), end: at(3, 16) };
        tpl.racks_by_week.clear();
        let Err(EngineError::Validation(problems)) = materialize(&tpl) else {
            panic!("expected validation error");
        };
        assert_eq!(problems, vec!["end time must be after start time".to_string()]);
    }

    #[test]
    fn missing_week_rejects_whole_template() {
        let mut tpl = template(3);
        tpl.racks_by_week.remove(&0);
        let Err(EngineError::Validation(problems)) = materialize(&tpl) else {
            panic!("expected validation error");
        };
        assert_eq!(problems, vec!["Week 1 has no racks assigned".to_string()]);
    }

    #[test]
    fn all_problems_reported() {
        let mut tpl = template(3);
        tpl.racks_by_week.insert(0, vec![]);
        tpl.racks_by_week.insert(1, vec![3, 3]);
        tpl.racks_by_week.insert(2, vec![MAX_RACK_NUMBER + 1]);
        tpl.racks_by_week.insert(5, vec![1]);
        tpl.capacity_by_week.insert(1, 0);
        let Err(EngineError::Validation(problems)) = materialize(&tpl) else {
            panic!("expected validation error");
        };
        assert_eq!(problems.len(), 5, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("Week 6 is beyond")));
    }

    #[test]
    fn session_length_capped() {
        let mut tpl = template(1);
        tpl.first = Span::new(at(3, 6), at(3, 6) + Duration::hours(MAX_SESSION_HOURS + 1));
        assert!(matches!(materialize(&tpl), Err(EngineError::Validation(_))));
    }

    #[test]
    fn zero_weeks_rejected() {
        let tpl = template(0);
        assert!(matches!(materialize(&tpl), Err(EngineError::Validation(_))));
    }
}
