//! Scheduler behaviour visible to modules: wall-clock alignment, phase
//! isolation, and boundary-deferred timers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use grid_broker::{Scheduler, TimerOutcome};

fn standard_rotation(now: Instant) -> Scheduler {
    let mut sched = Scheduler::new();
    sched.register("gm", Duration::from_millis(100), now);
    sched.register("sc", Duration::from_millis(200), now);
    sched.register("lb", Duration::from_millis(100), now);
    sched
}

#[test]
fn one_second_in_lands_mid_second_phase() {
    let now = Instant::now();
    let mut sched = standard_rotation(now);
    // Force an alignment pass at a wall clock of exactly one second: the
    // 400 ms round has consumed 200 ms, placing us 100 ms into the 200 ms
    // phase with 100 ms remaining.
    let changes = sched.poll(now + Duration::from_millis(101), 1_000);
    assert!(!changes.is_empty());
    assert_eq!(sched.phase(), 1);
    assert_eq!(sched.active_module(), Some("sc"));
    let remaining = sched.time_remaining(now + Duration::from_millis(101));
    assert_eq!(remaining, Duration::from_millis(100));
}

#[test]
fn aligned_nodes_pick_the_same_phase() {
    let start = Instant::now();
    let mut left = standard_rotation(start);
    let mut right = standard_rotation(start);

    // Forty milliseconds of clock disagreement, well under the shortest
    // phase, disappears at the first alignment.
    let tick = start + Duration::from_millis(101);
    left.poll(tick, 7_340);
    right.poll(tick, 7_380);
    assert_eq!(left.phase(), right.phase());
    assert_eq!(left.active_module(), right.active_module());
}

#[test]
fn deferred_timer_runs_before_the_next_module() {
    let now = Instant::now();
    let mut sched = standard_rotation(now);
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // "lb" asks for work at the start of its next turn; "gm" is first in
    // the rotation at phase 0... use gm so the boundary is phase 0 -> 1.
    let handle = sched.allocate_timer("gm").unwrap();
    let log = Arc::clone(&order);
    sched
        .schedule_timer(
            handle,
            None,
            Box::new(move |outcome| {
                assert_eq!(outcome, TimerOutcome::Expired);
                log.lock().unwrap().push("deferred".to_string());
            }),
            now,
        )
        .unwrap();

    let log = Arc::clone(&order);
    sched
        .schedule_now(
            "sc",
            Box::new(move |_| log.lock().unwrap().push("sc-handler".to_string())),
            false,
        )
        .unwrap();

    sched.poll(now + Duration::from_millis(101), 101);
    while let Some((task, outcome)) = sched.take_task() {
        task(outcome);
        sched.task_finished();
    }

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, vec!["deferred".to_string(), "sc-handler".to_string()]);

    // The deferred timer fired exactly once; later boundaries are quiet.
    sched.poll(now + Duration::from_millis(302), 302);
    assert!(sched.take_task().is_none());
}

#[test]
fn tasks_never_run_outside_their_owner_phase() {
    let now = Instant::now();
    let mut sched = standard_rotation(now);
    sched.schedule_now("lb", Box::new(|_| {}), true).unwrap();

    // Phases gm and sc pass; the lb task stays queued.
    assert!(sched.take_task().is_none());
    sched.poll(now + Duration::from_millis(101), 101);
    assert!(sched.take_task().is_none());

    // Once lb's phase arrives the task surfaces.
    sched.poll(now + Duration::from_millis(302), 302);
    assert_eq!(sched.active_module(), Some("lb"));
    assert!(sched.take_task().is_some());
}
