// tests/scheduler.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use page_sentinel::proxy::ProxyTable;
use page_sentinel::registry::{CheckOutcome, WatchRegistry, WatchStatus};
use page_sentinel::schedule::{overdue_secs, DayWindow, WeekSchedule};
use page_sentinel::scheduler::{Scheduler, SchedulerCfg};
use page_sentinel::watch::{Tag, Watch};

fn checked(reg: &WatchRegistry, id: uuid::Uuid) {
    let gen = reg.try_mark_queued(id).expect("queueable");
    assert!(reg.mark_running(id, gen));
    reg.finish(
        id,
        gen,
        CheckOutcome::Checked {
            changed: false,
            filter_missing: false,
            duration_ms: 1,
        },
    );
}

#[test]
fn sixty_second_interval_boundary() {
    let t0 = Utc.with_ymd_and_hms(2025, 9, 8, 12, 0, 0).unwrap();
    assert_eq!(overdue_secs(t0 + Duration::seconds(59), Some(t0), 60, 0, None).unwrap(), None);
    assert_eq!(overdue_secs(t0 + Duration::seconds(61), Some(t0), 60, 0, None).unwrap(), Some(1));
    // Jitter pushes the due time out.
    assert_eq!(overdue_secs(t0 + Duration::seconds(61), Some(t0), 60, 5, None).unwrap(), None);
}

#[test]
fn zero_interval_is_an_error() {
    assert!(overdue_secs(Utc::now(), None, 0, 0, None).is_err());
}

fn weekday_window(day: &str, start: &str, minutes: u32) -> WeekSchedule {
    let mut days = BTreeMap::new();
    days.insert(
        day.to_string(),
        DayWindow {
            enabled: true,
            start_time: start.to_string(),
            duration_minutes: minutes,
        },
    );
    WeekSchedule {
        enabled: true,
        timezone: "UTC".into(),
        days,
    }
}

#[test]
fn outside_the_window_nothing_is_enqueued() {
    // Monday 09:00-10:00 UTC via a tag schedule.
    let mut w = Watch::new("https://a.example").with_interval(60);
    w.tags = vec!["office".into()];
    let tag = Tag {
        name: "office".into(),
        schedule: Some(weekday_window("monday", "09:00", 60)),
        ..Tag::default()
    };
    let reg = Arc::new(WatchRegistry::new(vec![w], vec![tag], None, 0));
    let s = Scheduler::new(reg.clone(), Arc::new(ProxyTable::empty()), SchedulerCfg::default());

    let tuesday = Utc.with_ymd_and_hms(2025, 9, 9, 9, 30, 0).unwrap();
    assert!(s.tick(tuesday).is_empty());
    let monday_late = Utc.with_ymd_and_hms(2025, 9, 8, 10, 0, 0).unwrap();
    assert!(s.tick(monday_late).is_empty());
    let monday_in = Utc.with_ymd_and_hms(2025, 9, 8, 9, 30, 0).unwrap();
    assert_eq!(s.tick(monday_in).len(), 1);
}

#[test]
fn at_most_one_job_per_watch_across_ticks() {
    let w = Watch::new("https://a.example").with_interval(60);
    let id = w.uuid;
    let reg = Arc::new(WatchRegistry::new(vec![w], vec![], None, 0));
    let s = Scheduler::new(reg.clone(), Arc::new(ProxyTable::empty()), SchedulerCfg::default());

    let now = Utc::now();
    let first = s.tick(now);
    assert_eq!(first.len(), 1);
    assert!(reg.mark_running(id, first[0].generation));
    // Long overdue while running: still not queued again.
    assert!(s.tick(now + Duration::hours(2)).is_empty());
    assert_eq!(reg.state(id).unwrap().status, WatchStatus::Running);
}

#[test]
fn checked_watch_comes_back_after_its_interval() {
    let w = Watch::new("https://a.example").with_interval(60);
    let id = w.uuid;
    let reg = Arc::new(WatchRegistry::new(vec![w], vec![], None, 0));
    let s = Scheduler::new(reg.clone(), Arc::new(ProxyTable::empty()), SchedulerCfg::default());

    checked(&reg, id);
    let last = reg.state(id).unwrap().last_checked_at.unwrap();
    assert!(s.tick(last + Duration::seconds(59)).is_empty());
    let jobs = s.tick(last + Duration::seconds(61));
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].priority, 1);
}

#[test]
fn failed_watch_stays_schedulable() {
    let w = Watch::new("https://a.example").with_interval(60);
    let id = w.uuid;
    let reg = Arc::new(WatchRegistry::new(vec![w], vec![], None, 0));
    let s = Scheduler::new(reg.clone(), Arc::new(ProxyTable::empty()), SchedulerCfg::default());

    let gen = reg.try_mark_queued(id).unwrap();
    reg.mark_running(id, gen);
    reg.finish(
        id,
        gen,
        CheckOutcome::Failed {
            error: "HTTP status 503".into(),
            duration_ms: 3,
        },
    );
    assert_eq!(reg.state(id).unwrap().status, WatchStatus::Error);
    let later = Utc::now() + Duration::seconds(120);
    assert_eq!(s.tick(later).len(), 1);
}

#[test]
fn jitter_stays_within_bounds() {
    let watches: Vec<Watch> = (0..50).map(|i| Watch::new(format!("https://{i}.example"))).collect();
    let reg = WatchRegistry::new(watches, vec![], None, 30);
    for (_, s) in reg.view().watches {
        assert!(s.jitter_secs <= 30);
    }
}
