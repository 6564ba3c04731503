// tests/command_guard.rs

use procwarden::errors::{ConflictError, SupervisorError};
use procwarden::guard::{CommandGuard, CommandTag, Origin, RELOAD_COMMAND};
use proptest::prelude::*;

#[test]
fn nested_call_under_same_root_is_reentrant() {
    let guard = CommandGuard::new();

    let outer = guard.acquire(&CommandTag::internal("manage_watchers")).unwrap();
    let inner = guard.acquire(&outer.nested("watcher_manage_processes")).unwrap();
    let innermost = guard.acquire(&inner.nested("watcher_spawn_process")).unwrap();

    assert_eq!(innermost.depth(), 3);
    assert_eq!(guard.holder().as_deref(), Some("manage_watchers"));
    assert_eq!(
        guard.current().as_deref(),
        Some("manage_watchers/watcher_manage_processes/watcher_spawn_process")
    );

    drop(innermost);
    assert_eq!(guard.depth(), 2);
    drop(inner);
    drop(outer);
    assert!(guard.is_idle());
}

#[test]
fn independent_command_is_rejected_naming_the_holder() {
    let guard = CommandGuard::new();
    let outer = guard.acquire(&CommandTag::internal("manage_watchers")).unwrap();
    let _nested = guard.acquire(&outer.nested("arbiter_start_watchers")).unwrap();

    let err = guard
        .acquire(&CommandTag::external("watcher_stop"))
        .unwrap_err();

    assert_eq!(err, ConflictError::new("manage_watchers"));
    assert_eq!(
        err.to_string(),
        "arbiter is already running manage_watchers command"
    );
    // The rejected attempt leaves the slot untouched.
    assert_eq!(guard.depth(), 2);
}

#[test]
fn slot_is_free_again_after_holder_finishes() {
    let guard = CommandGuard::new();
    {
        let _tick = guard.acquire(&CommandTag::internal("manage_watchers")).unwrap();
        assert!(guard.acquire(&CommandTag::external("watcher_stop")).is_err());
    }

    let stop = guard.acquire(&CommandTag::external("watcher_stop")).unwrap();
    assert_eq!(stop.depth(), 1);
    assert_eq!(guard.holder().as_deref(), Some("watcher_stop"));
}

fn failing_command(guard: &CommandGuard) -> Result<(), SupervisorError> {
    let token = guard.acquire(&CommandTag::external("watcher_start"))?;
    let _inner = guard.acquire(&token.nested("watcher_spawn_process"))?;
    Err(SupervisorError::WatcherNotFound("ghost".to_string()))
}

#[test]
fn slot_is_restored_when_a_command_fails() {
    let guard = CommandGuard::new();

    let result = failing_command(&guard);

    assert!(matches!(result, Err(SupervisorError::WatcherNotFound(_))));
    assert!(guard.is_idle());
    assert_eq!(guard.depth(), 0);
}

#[test]
fn conflict_propagates_through_question_mark() {
    let guard = CommandGuard::new();
    let _held = guard.acquire(&CommandTag::external("arbiter_stop")).unwrap();

    match failing_command(&guard) {
        Err(SupervisorError::Conflict(e)) => assert_eq!(e.holder, "arbiter_stop"),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(guard.depth(), 1);
}

#[test]
fn reload_in_flight_rejects_external_commands_only() {
    let guard = CommandGuard::new();
    guard.set_restarting(true);

    let err = guard
        .acquire(&CommandTag::external("watcher_start"))
        .unwrap_err();
    assert_eq!(err.holder, RELOAD_COMMAND);

    let tick = guard.acquire(&CommandTag::internal("manage_watchers")).unwrap();
    drop(tick);
    let quit = guard.acquire(&CommandTag::new("arbiter_stop", Origin::Internal)).unwrap();
    drop(quit);
    let reload = guard.acquire(&CommandTag::external(RELOAD_COMMAND)).unwrap();
    drop(reload);

    guard.set_restarting(false);
    let _start = guard.acquire(&CommandTag::external("watcher_start")).unwrap();
}

#[test]
fn tag_helpers() {
    let root = CommandTag::internal("manage_watchers");
    let child = CommandTag::under(Some(&root), "watcher_stop");

    assert_eq!(child.path(), "manage_watchers/watcher_stop");
    assert_eq!(child.root(), "manage_watchers");
    assert_eq!(child.origin(), Origin::Internal);
    assert!(child.is_nested());

    let top = CommandTag::under(None, "watcher_stop");
    assert_eq!(top.root(), "watcher_stop");
    assert_eq!(top.origin(), Origin::External);
    assert!(!top.is_nested());
}

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z_]{1,12}"
}

proptest! {
    #[test]
    fn nesting_depth_tracks_open_tokens(
        root in name_strategy(),
        children in proptest::collection::vec(name_strategy(), 0..8),
        intruder in name_strategy(),
    ) {
        prop_assume!(intruder != root);
        let guard = CommandGuard::new();

        let mut tokens = vec![guard.acquire(&CommandTag::external(&root)).unwrap()];
        for child in &children {
            let tag = tokens.last().unwrap().nested(child);
            tokens.push(guard.acquire(&tag).unwrap());
            prop_assert_eq!(guard.depth(), tokens.len());
        }

        let err = guard.acquire(&CommandTag::external(&intruder)).unwrap_err();
        prop_assert_eq!(&err.holder, &root);

        while let Some(token) = tokens.pop() {
            drop(token);
            prop_assert_eq!(guard.depth(), tokens.len());
        }
        prop_assert!(guard.is_idle());
        prop_assert!(guard.acquire(&CommandTag::external(&intruder)).is_ok());
    }
}
