use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, Weekday};

use rackbook::clock::FixedClock;
use rackbook::engine::{Engine, EngineError, EngineSettings, InstanceEdit, TemplateDraft};
use rackbook::model::*;
use rackbook::notify::NotifyHub;
use rackbook::store::InMemoryStore;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn coach(n: usize) -> Actor {
    Actor { id: format!("coach{n}@club"), name: format!("Coach {n}"), is_admin: false }
}

fn admin() -> Actor {
    Actor { id: "admin@club".into(), name: "Admin".into(), is_admin: true }
}

/// Monday 17 March 2025 plus `day` days at `hour`.
fn slot(day: u32, hour: u32) -> Stamp {
    NaiveDate::from_ymd_opt(2025, 3, 17 + day).unwrap().and_hms_opt(hour, 0, 0).unwrap()
}

fn draft(side: Side, start: Stamp, weeks: u32, racks: Vec<RackNumber>, capacity: u32) -> TemplateDraft {
    TemplateDraft {
        side,
        title: "Bench squad".into(),
        start,
        end_time: start.time() + chrono::Duration::hours(1),
        week_count: weeks,
        racks_by_week: BTreeMap::new(),
        racks,
        capacity_by_week: BTreeMap::new(),
        default_capacity: capacity,
        areas: Vec::new(),
        locked: false,
        override_reason: None,
    }
}

fn engine() -> Arc<Engine> {
    let now = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
    Arc::new(
        Engine::new(Arc::new(InMemoryStore::new()), Arc::new(NotifyHub::new()), EngineSettings::default())
            .with_clock(Arc::new(FixedClock::new(now))),
    )
}

fn open_schedule() -> CapacitySchedule {
    let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
    let days = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    CapacitySchedule {
        periods: vec![PeriodType { name: "General User".into(), capacity: 400, closed: false }],
        weekly: days
            .iter()
            .map(|&weekday| WeeklyBlock { weekday, start: t(6), end: t(22), period: "General User".into() })
            .collect(),
        dated: Vec::new(),
        overrides: Vec::new(),
    }
}

/// Non-overlapping semester bookings: every day, every hour, pairs of racks.
async fn bench_fill(engine: &Engine) -> usize {
    println!("\n── fill: 16-week bookings, disjoint slots ──");
    let mut latencies = Vec::new();
    let started = Instant::now();
    let mut n = 0;
    for day in 0..7 {
        for hour in 6..22 {
            for pair in 0..8u16 {
                let racks = vec![pair * 2 + 1, pair * 2 + 2];
                let t0 = Instant::now();
                engine
                    .submit_booking(&coach(n), draft(Side::Power, slot(day, hour), 16, racks, 4))
                    .await
                    .expect("disjoint submission failed");
                latencies.push(t0.elapsed());
                n += 1;
            }
        }
    }
    let elapsed = started.elapsed();
    println!(
        "  {n} bookings ({} sessions) in {:.2}s, {:.0} bookings/s",
        n * 16,
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("submit", &mut latencies);
    n
}

/// Many coaches racing for the same racks. Exactly one per slot may win.
async fn bench_contention(engine: Arc<Engine>) {
    println!("\n── contention: 32 coaches per slot, same racks ──");
    let slots = 20u32;
    let mut handles = Vec::new();
    for s in 0..slots {
        for c in 0..32 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let start = slot(s % 7, 6 + s / 7);
                let t0 = Instant::now();
                let r = engine
                    .submit_booking(&coach(c), draft(Side::Base, start, 8, vec![40, 41], 4))
                    .await;
                (t0.elapsed(), r)
            }));
        }
    }
    let mut latencies = Vec::new();
    let (mut won, mut conflicts, mut other) = (0, 0, 0);
    for h in handles {
        let (elapsed, r) = h.await.expect("task panicked");
        latencies.push(elapsed);
        match r {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => {
                eprintln!("  unexpected: {e}");
                other += 1;
            }
        }
    }
    println!("  won={won} (expected {slots}), conflicts={conflicts}, other={other}");
    assert_eq!(won, slots as usize, "double booking under contention");
    print_latency("contended submit", &mut latencies);
}

/// Capacity validation against a busy schedule: every submission is rejected.
async fn bench_capacity(engine: &Engine) {
    println!("\n── capacity: rejections against a saturated hour ──");
    // Each filled hour already holds 32 athletes.
    let mut saturated = open_schedule();
    saturated.periods[0].capacity = 64;
    engine
        .set_capacity_schedule(&admin(), Side::Power, saturated)
        .await
        .expect("schedule rejected");

    let mut latencies = Vec::new();
    let mut rejected = 0;
    for i in 0..200u32 {
        let start = slot(i % 7, 6 + (i / 7) % 16);
        let t0 = Instant::now();
        let r = engine
            .submit_booking(&coach(i as usize), draft(Side::Power, start, 16, vec![60], 40))
            .await;
        latencies.push(t0.elapsed());
        if matches!(r, Err(EngineError::Capacity(_))) {
            rejected += 1;
        }
    }
    println!("  rejected {rejected}/200");
    print_latency("capacity check", &mut latencies);
}

/// Process, edit and diff long bookings.
async fn bench_diff(engine: &Engine) {
    println!("\n── diff: process, edit, report ──");
    let mut latencies = Vec::new();
    for i in 0..50u16 {
        let start = slot(u32::from(i % 7), 6 + u32::from(i / 7));
        let out = engine
            .submit_booking(&coach(usize::from(i)), draft(Side::Base, start, 52, vec![50 + (i % 10)], 6))
            .await;
        let Ok(out) = out else { continue };
        engine.mark_processed(&admin(), out.template_id).await.expect("process failed");
        let view = engine.get_booking(out.template_id).await.expect("booking vanished");
        let edits = view
            .instances
            .iter()
            .step_by(4)
            .take(13)
            .map(|inst| InstanceEdit { instance_id: inst.id, racks: None, capacity: Some(8), start: None, end: None })
            .collect();
        engine
            .edit_instances(&coach(usize::from(i)), out.template_id, edits, None)
            .await
            .expect("edit failed");
        let t0 = Instant::now();
        let report = engine.change_report(out.template_id).await.expect("report failed");
        latencies.push(t0.elapsed());
        assert!(!report.is_empty());
    }
    print_latency("change_report (52 weeks)", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("rackbook stress bench");
    let engine = engine();
    bench_fill(&engine).await;
    bench_contention(engine.clone()).await;
    bench_capacity(&engine).await;
    bench_diff(&engine).await;
}
