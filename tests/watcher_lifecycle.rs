// tests/watcher_lifecycle.rs

use std::time::Duration;

use procwarden::engine::LoopEvent;
use procwarden::errors::SupervisorError;
use procwarden::process::{ExitKind, StopSignal};
use procwarden::stream::SinkConfig;
use procwarden::watcher::{StopProgress, WatcherStatus};
use procwarden_test_utils::{CollectingSink, Harness, WatcherBuilder, init_tracing};

#[test]
fn start_spawns_target_and_redirects_both_streams() {
    init_tracing();
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").numprocesses(3).build();

    w.start(&mut h.sv(), None).unwrap();

    assert_eq!(w.status(), WatcherStatus::Active);
    assert_eq!(w.pids(), vec![1000, 1001, 1002]);
    assert_eq!(w.redirector().active_fds().len(), 6);
    assert_eq!(h.reactor.registered_fds().len(), 6);
    assert!(h.guard.is_idle());
}

#[test]
fn start_twice_is_a_no_op() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").numprocesses(2).build();

    w.start(&mut h.sv(), None).unwrap();
    w.start(&mut h.sv(), None).unwrap();

    assert_eq!(h.os.spawn_attempts(), 2);
    assert_eq!(w.process_count(), 2);
}

#[test]
fn spawning_gives_up_after_max_retry_and_stops_watcher() {
    init_tracing();
    let mut h = Harness::new();
    h.os.fail_all_spawns(true);
    let mut w = WatcherBuilder::new("broken")
        .cmd("/nonexistent")
        .max_retry(5)
        .build();

    let err = w.start(&mut h.sv(), None).unwrap_err();

    match err {
        SupervisorError::SpawnExhausted {
            watcher, attempts, ..
        } => {
            assert_eq!(watcher, "broken");
            assert_eq!(attempts, 5);
        }
        other => panic!("expected SpawnExhausted, got {other:?}"),
    }
    assert_eq!(h.os.spawn_attempts(), 5);
    assert_eq!(w.status(), WatcherStatus::Stopped);
    assert_eq!(w.process_count(), 0);
    assert!(w.last_failure().unwrap().contains("No such file"));
    assert!(!w.redirector().is_started());
    assert!(h.guard.is_idle());

    // A stopped watcher is left alone by the tick.
    w.manage_processes(&mut h.sv(), None).unwrap();
    assert_eq!(h.os.spawn_attempts(), 5);
}

#[test]
fn successful_spawn_resets_retry_counter() {
    let mut h = Harness::new();
    h.os.fail_next_spawns(3);
    let mut w = WatcherBuilder::new("flaky").max_retry(5).build();

    w.start(&mut h.sv(), None).unwrap();

    assert_eq!(h.os.spawn_attempts(), 4);
    assert_eq!(w.retry_count(), 0);
    assert_eq!(w.status(), WatcherStatus::Active);
    assert_eq!(w.process_count(), 1);
}

#[test]
fn fresh_start_gets_a_fresh_retry_budget() {
    let mut h = Harness::new();
    h.os.fail_next_spawns(2);
    let mut w = WatcherBuilder::new("flaky")
        .numprocesses(2)
        .max_retry(2)
        .build();

    // Two failures exhaust the budget before the first process starts.
    assert!(w.start(&mut h.sv(), None).is_err());
    assert_eq!(h.os.spawn_attempts(), 2);
    assert_eq!(w.status(), WatcherStatus::Stopped);

    // A fresh start gets a fresh budget.
    w.start(&mut h.sv(), None).unwrap();
    assert_eq!(w.process_count(), 2);
}

#[test]
fn reaping_twice_is_harmless() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();
    let pid = w.pids()[0];

    h.os.exit(pid, ExitKind::Exited(0));
    assert!(w.reap_process(&mut h.sv(), pid, ExitKind::Exited(0), None).unwrap());
    assert!(!w.reap_process(&mut h.sv(), pid, ExitKind::Exited(0), None).unwrap());

    assert!(!w.owns(pid));
    assert!(w.redirector().active_fds().is_empty());
    assert!(h.reactor.registered_fds().is_empty());
    // Exactly one replacement was scheduled.
    assert_eq!(h.reactor.pending_timers().len(), 1);
}

#[test]
fn reaped_process_is_replaced_on_respawn() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").numprocesses(2).build();
    w.start(&mut h.sv(), None).unwrap();

    h.os.exit(1000, ExitKind::Exited(1));
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert_eq!(w.pids(), vec![1001, 1002]);
    assert_eq!(w.status(), WatcherStatus::Active);
    let events = h.reactor.fire_all();
    assert!(matches!(
        events.as_slice(),
        [LoopEvent::Respawn { watcher }] if watcher == "web"
    ));
}

#[test]
fn replacement_inherits_recycled_descriptors() {
    let mut h = Harness::new();
    h.os.plan_fds([(30, 31), (30, 31)]);
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();

    h.os.exit(1000, ExitKind::Exited(1));
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert_eq!(w.pids(), vec![1001]);
    let mut fds = h.reactor.registered_fds();
    fds.sort_unstable();
    assert_eq!(fds, vec![30, 31]);
    assert_eq!(h.reactor.route(30).unwrap().pid, 1001);
    assert_eq!(w.redirector().owner(31).unwrap().pid, 1001);
}

#[test]
fn respawn_delay_holds_back_the_replacement() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web")
        .numprocesses(2)
        .respawn_delay(Duration::from_secs(60))
        .build();
    w.start(&mut h.sv(), None).unwrap();

    h.os.exit(1000, ExitKind::Exited(1));
    w.manage_processes(&mut h.sv(), None).unwrap();
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert_eq!(w.pids(), vec![1001]);
    assert_eq!(h.os.spawn_attempts(), 2);
    assert_eq!(w.pending_respawns(), 1);
    let timers = h.reactor.pending_timers();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].1, Duration::from_secs(60));

    w.respawn_due(&mut h.sv(), None).unwrap();

    assert_eq!(w.pids(), vec![1001, 1002]);
    assert_eq!(w.pending_respawns(), 0);
    assert_eq!(w.status(), WatcherStatus::Active);
}

#[test]
fn stopping_cancels_pending_respawns() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web")
        .respawn_delay(Duration::from_secs(60))
        .build();
    w.start(&mut h.sv(), None).unwrap();
    h.os.exit(1000, ExitKind::Exited(1));
    w.manage_processes(&mut h.sv(), None).unwrap();
    let (timer, _) = h.reactor.pending_timers()[0];

    assert_eq!(w.stop(&mut h.sv(), None).unwrap(), StopProgress::Stopped);

    assert_eq!(w.pending_respawns(), 0);
    assert!(h.reactor.cancelled_timers().contains(&timer));
    assert_eq!(h.os.spawn_attempts(), 1);
}

#[test]
fn no_respawn_stops_watcher_when_last_process_exits() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("oneshot").respawn(false).build();
    w.start(&mut h.sv(), None).unwrap();

    h.os.exit(1000, ExitKind::Exited(0));
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert_eq!(w.status(), WatcherStatus::Stopped);
    assert_eq!(h.os.spawn_attempts(), 1);
    assert!(h.reactor.pending_timers().is_empty());
}

#[test]
fn stop_waits_for_exit_then_kills_stragglers() {
    init_tracing();
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web")
        .numprocesses(2)
        .graceful_timeout(Duration::from_secs(3))
        .stop_signal(StopSignal::Int)
        .build();
    w.start(&mut h.sv(), None).unwrap();

    assert_eq!(w.stop(&mut h.sv(), None).unwrap(), StopProgress::Pending);
    assert_eq!(w.status(), WatcherStatus::Stopping);
    assert_eq!(
        h.os.terminated(),
        &[(1000, StopSignal::Int), (1001, StopSignal::Int)]
    );
    let timers = h.reactor.pending_timers();
    assert_eq!(timers.len(), 2);
    assert!(timers.iter().all(|(_, d)| *d == Duration::from_secs(3)));

    // Stopping again is not a new stop.
    assert_eq!(w.stop(&mut h.sv(), None).unwrap(), StopProgress::Pending);
    assert_eq!(h.os.terminated().len(), 2);

    // 1000 honours the signal.
    h.os.exit(1000, ExitKind::Signaled(2));
    w.manage_processes(&mut h.sv(), None).unwrap();
    assert_eq!(w.pids(), vec![1001]);
    assert_eq!(w.status(), WatcherStatus::Stopping);
    assert_eq!(h.reactor.cancelled_timers().len(), 1);

    // 1001 does not; its grace timer fires.
    let events = h.reactor.fire_all();
    assert_eq!(events.len(), 1);
    let LoopEvent::GraceExpired { watcher, pid } = &events[0] else {
        panic!("expected grace expiry, got {:?}", events[0]);
    };
    assert_eq!((watcher.as_str(), *pid), ("web", 1001));
    assert!(w.kill_straggler(&mut h.sv(), 1001, None).unwrap());
    assert_eq!(h.os.killed(), &[1001]);

    w.manage_processes(&mut h.sv(), None).unwrap();
    assert_eq!(w.status(), WatcherStatus::Stopped);
    assert_eq!(w.process_count(), 0);
    assert!(!w.redirector().is_started());
    assert!(h.reactor.registered_fds().is_empty());
    assert!(h.reactor.pending_timers().is_empty());
}

#[test]
fn grace_expiry_after_exit_is_ignored() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();
    w.stop(&mut h.sv(), None).unwrap();

    h.os.exit(1000, ExitKind::Exited(0));
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert!(!w.kill_straggler(&mut h.sv(), 1000, None).unwrap());
    assert!(h.os.killed().is_empty());
}

#[test]
fn stopping_an_idle_watcher_completes_immediately() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").autostart(false).build();

    assert_eq!(w.stop(&mut h.sv(), None).unwrap(), StopProgress::Stopped);
    assert_eq!(w.status(), WatcherStatus::Init);
    assert!(h.os.terminated().is_empty());
}

#[test]
fn start_is_rejected_while_stopping() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();
    w.stop(&mut h.sv(), None).unwrap();

    let err = w.start(&mut h.sv(), None).unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidState { .. }));
    assert!(h.guard.is_idle());
}

#[test]
fn lowering_numprocesses_retires_oldest_first() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").numprocesses(3).build();
    w.start(&mut h.sv(), None).unwrap();

    assert_eq!(w.set_numprocesses(&mut h.sv(), 1, None).unwrap(), 1);

    let terminated: Vec<u32> = h.os.terminated().iter().map(|(pid, _)| *pid).collect();
    assert_eq!(terminated, vec![1000, 1001]);
    assert_eq!(w.live_count(), 1);
    assert_eq!(w.status(), WatcherStatus::Active);

    // Retired processes are not replaced when they exit.
    h.os.exit(1000, ExitKind::Signaled(15));
    h.os.exit(1001, ExitKind::Signaled(15));
    w.manage_processes(&mut h.sv(), None).unwrap();
    assert_eq!(w.pids(), vec![1002]);
    assert!(
        h.reactor
            .fire_all()
            .iter()
            .all(|e| !matches!(e, LoopEvent::Respawn { .. }))
    );
}

#[test]
fn raising_numprocesses_spawns_the_difference() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();

    w.set_numprocesses(&mut h.sv(), 3, None).unwrap();

    assert_eq!(w.process_count(), 3);
    assert_eq!(w.definition().numprocesses, 3);
    assert_eq!(w.status(), WatcherStatus::Active);
}

#[test]
fn numprocesses_of_a_stopped_watcher_applies_on_next_start() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();

    w.set_numprocesses(&mut h.sv(), 2, None).unwrap();
    assert_eq!(h.os.spawn_attempts(), 0);

    w.start(&mut h.sv(), None).unwrap();
    assert_eq!(w.process_count(), 2);
}

#[test]
fn restart_waits_for_processes_then_starts_fresh_ones() {
    let mut h = Harness::new();
    h.os.exit_on_terminate(true);
    let mut w = WatcherBuilder::new("web").numprocesses(2).build();
    w.start(&mut h.sv(), None).unwrap();

    w.restart(&mut h.sv(), None).unwrap();
    assert!(w.is_restart_pending());
    assert_eq!(w.status(), WatcherStatus::Stopping);

    w.manage_processes(&mut h.sv(), None).unwrap();

    assert!(!w.is_restart_pending());
    assert_eq!(w.status(), WatcherStatus::Active);
    assert_eq!(w.pids(), vec![1002, 1003]);
}

#[test]
fn stop_cancels_a_pending_restart() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();
    w.start(&mut h.sv(), None).unwrap();
    w.restart(&mut h.sv(), None).unwrap();

    w.stop(&mut h.sv(), None).unwrap();
    h.os.exit(1000, ExitKind::Signaled(15));
    w.manage_processes(&mut h.sv(), None).unwrap();

    assert_eq!(w.status(), WatcherStatus::Stopped);
    assert_eq!(h.os.spawn_attempts(), 1);
}

#[test]
fn null_sink_streams_get_no_pipe() {
    let mut h = Harness::new();
    let sink = CollectingSink::new();
    let mut w = WatcherBuilder::new("quiet")
        .stdout(SinkConfig::Null)
        .build_with_sink(&sink);

    w.start(&mut h.sv(), None).unwrap();

    let spec = h.os.last_spec().unwrap();
    assert!(!spec.pipe_stdout);
    assert!(spec.pipe_stderr);
    assert_eq!(w.redirector().active_fds().len(), 1);
}

#[test]
fn nested_operations_run_under_the_callers_root() {
    let mut h = Harness::new();
    let mut w = WatcherBuilder::new("web").build();

    let guard = &h.guard;
    let token = guard
        .acquire(&procwarden::guard::CommandTag::internal("manage_watchers"))
        .unwrap();
    let mut sv = procwarden::watcher::Supervision::new(&mut h.os, &mut h.reactor, guard);

    w.start(&mut sv, Some(token.tag())).unwrap();
    let err = w.start(&mut sv, None).unwrap_err();

    assert!(matches!(err, SupervisorError::Conflict(c) if c.holder == "manage_watchers"));
    drop(token);
    assert!(h.guard.is_idle());
}
