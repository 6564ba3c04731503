// tests/stream_redirector.rs

use std::collections::BTreeSet;

use procwarden::errors::{ReactorError, RedirectError};
use procwarden::process::{ProcessHandle, StreamName, StreamPipe};
use procwarden::reactor::{Reactor, StreamRoute};
use procwarden::stream::{Redirection, StreamRedirector};
use procwarden_test_utils::{CollectingSink, FakeReactor};
use proptest::prelude::*;

fn redirector(sink: &CollectingSink) -> StreamRedirector {
    let mut r = StreamRedirector::new("web", sink.boxed(), sink.boxed());
    r.start();
    r
}

fn route(pid: u32, fd: i32, stream: StreamName) -> StreamRoute {
    StreamRoute {
        watcher: "web".to_string(),
        pid,
        fd,
        stream,
    }
}

fn handle(pid: u32, stdout: i32, stderr: i32) -> ProcessHandle {
    ProcessHandle::new(
        pid,
        "worker",
        None,
        Some(StreamPipe::from_raw_number(stdout)),
        Some(StreamPipe::from_raw_number(stderr)),
    )
}

#[test]
fn stop_one_reports_only_the_first_stop() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.start_one(&mut reactor, 23, StreamName::Stdout, 1000).unwrap();

    assert!(r.stop_one(&mut reactor, 23));
    assert!(!r.stop_one(&mut reactor, 23));
    assert!(!reactor.is_registered(23));
    // The second call never reaches the reactor.
    assert_eq!(reactor.unregister_calls(), &[23]);
}

#[test]
fn descriptor_lost_by_reactor_is_cleared_and_reusable() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.start_one(&mut reactor, 23, StreamName::Stdout, 1000).unwrap();
    reactor.forget_registration(23);

    assert!(r.stop_one(&mut reactor, 23));
    assert!(!r.is_active(23));
    assert_eq!(r.owner(23), None);

    r.start_one(&mut reactor, 23, StreamName::Stdout, 1001)
        .expect("fd 23 must be registrable again");
    assert_eq!(
        r.owner(23),
        Some(Redirection {
            pid: 1001,
            stream: StreamName::Stdout
        })
    );
    assert_eq!(reactor.route(23).map(|rt| rt.pid), Some(1001));
}

#[test]
fn closed_descriptor_error_is_swallowed_on_stop() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.start_one(&mut reactor, 30, StreamName::Stderr, 1000).unwrap();
    reactor.fail_unregister_with_ebadf(30);

    assert!(r.stop_one(&mut reactor, 30));
    assert!(!r.is_active(30));
    assert!(r.active_fds().is_empty());
}

#[test]
fn starting_an_active_descriptor_is_escalated() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.start_one(&mut reactor, 23, StreamName::Stdout, 1000).unwrap();
    let err = r
        .start_one(&mut reactor, 23, StreamName::Stdout, 1001)
        .unwrap_err();

    assert!(matches!(err, RedirectError::AlreadyActive(23)));
    // Original owner untouched, and the reactor was not asked twice.
    assert_eq!(r.owner(23).map(|o| o.pid), Some(1000));
    assert_eq!(reactor.register_calls(), &[23]);
}

#[test]
fn duplicate_registration_in_reactor_is_escalated() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    // Someone else already watches fd 23.
    reactor
        .register_read(route(999, 23, StreamName::Stdout))
        .unwrap();

    let err = r
        .start_one(&mut reactor, 23, StreamName::Stdout, 1000)
        .unwrap_err();

    match err {
        RedirectError::Registration {
            fd: 23,
            source: ReactorError::AlreadyRegistered(23),
        } => {}
        other => panic!("expected registration failure, got {other:?}"),
    }
    assert!(!r.is_active(23));
}

#[test]
fn recycled_descriptor_from_unreaped_process_is_replaced() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.add_redirections(&mut reactor, &handle(1000, 23, 24)).unwrap();

    // pid 1000 died without its redirections being removed; the OS hands
    // fd 23 to the next process.
    let added = r
        .add_redirections(&mut reactor, &handle(1001, 23, 25))
        .unwrap();

    assert_eq!(added, vec![23, 25]);
    assert_eq!(r.owner(23).map(|o| o.pid), Some(1001));
    assert_eq!(reactor.route(23).map(|rt| rt.pid), Some(1001));
    assert_eq!(r.active_fds(), vec![23, 24, 25]);
    assert_eq!(reactor.registered_fds(), vec![23, 24, 25]);
}

#[test]
fn failed_redirection_rolls_back_this_call_only() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);

    r.start_one(&mut reactor, 40, StreamName::Stdout, 900).unwrap();
    reactor
        .register_read(route(999, 42, StreamName::Stderr))
        .unwrap();

    let err = r
        .add_redirections(&mut reactor, &handle(1000, 41, 42))
        .unwrap_err();

    assert!(matches!(err, RedirectError::Registration { fd: 42, .. }));
    assert!(!r.is_active(41));
    assert!(!reactor.is_registered(41));
    assert!(r.is_active(40));
}

#[test]
fn remove_redirections_counts_existing_entries() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);
    let process = handle(1000, 23, 24);

    r.add_redirections(&mut reactor, &process).unwrap();
    reactor.forget_registration(24);

    assert_eq!(r.remove_redirections(&mut reactor, &process), 2);
    assert_eq!(r.remove_redirections(&mut reactor, &process), 0);
    assert!(reactor.registered_fds().is_empty());
}

#[test]
fn output_reaches_the_matching_sink() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);
    r.add_redirections(&mut reactor, &handle(1000, 23, 24)).unwrap();

    assert!(r.deliver(&route(1000, 23, StreamName::Stdout), b"hello\n"));
    assert!(r.deliver(&route(1000, 24, StreamName::Stderr), b"oops\n"));

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].watcher, "web");
    assert_eq!(chunks[0].stream, StreamName::Stdout);
    assert_eq!(chunks[1].stream, StreamName::Stderr);
    assert_eq!(sink.text(), "hello\noops\n");
}

#[test]
fn stale_output_is_dropped() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);
    r.start_one(&mut reactor, 23, StreamName::Stdout, 1001).unwrap();

    // Queued before fd 23 changed hands.
    assert!(!r.deliver(&route(1000, 23, StreamName::Stdout), b"old"));
    // Never redirected.
    assert!(!r.deliver(&route(1001, 50, StreamName::Stdout), b"stray"));

    assert!(sink.chunks().is_empty());
}

#[test]
fn finished_pipes_are_reported_to_their_sink_once() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);
    r.add_redirections(&mut reactor, &handle(1000, 20, 21)).unwrap();

    assert!(r.stream_closed(&route(1000, 20, StreamName::Stdout)));
    // A route recorded for an older owner of the descriptor.
    assert!(!r.stream_closed(&route(999, 21, StreamName::Stderr)));
    assert_eq!(sink.ended(), vec![(1000, StreamName::Stdout)]);

    r.stop_one(&mut reactor, 21);
    r.stop_one(&mut reactor, 21);
    assert_eq!(
        sink.ended(),
        vec![(1000, StreamName::Stdout), (1000, StreamName::Stderr)]
    );
}

#[test]
fn stop_clears_everything_and_is_idempotent() {
    let sink = CollectingSink::new();
    let mut reactor = FakeReactor::new();
    let mut r = redirector(&sink);
    r.add_redirections(&mut reactor, &handle(1000, 23, 24)).unwrap();
    r.add_redirections(&mut reactor, &handle(1001, 25, 26)).unwrap();
    reactor.forget_registration(25);

    assert_eq!(r.stop(&mut reactor), 4);
    assert!(!r.is_started());
    assert!(r.active_fds().is_empty());
    assert!(reactor.registered_fds().is_empty());

    assert_eq!(r.stop(&mut reactor), 0);
    assert!(r.start());
    assert!(!r.start());
}

#[derive(Debug, Clone)]
enum Op {
    Start(i32),
    Stop(i32),
    ReactorForgets(i32),
    ReactorClosed(i32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let fd = 20..26i32;
    prop_oneof![
        3 => fd.clone().prop_map(Op::Start),
        2 => fd.clone().prop_map(Op::Stop),
        1 => fd.clone().prop_map(Op::ReactorForgets),
        1 => fd.prop_map(Op::ReactorClosed),
    ]
}

proptest! {
    #[test]
    fn no_descriptor_is_ever_registered_twice(
        ops in proptest::collection::vec(op_strategy(), 1..60),
    ) {
        let sink = CollectingSink::new();
        let mut reactor = FakeReactor::new();
        let mut r = redirector(&sink);
        let mut pid = 1000u32;

        for op in ops {
            match op {
                Op::Start(fd) => {
                    // Reuse discipline: a descriptor number is stopped
                    // before it is started again.
                    r.stop_one(&mut reactor, fd);
                    pid += 1;
                    prop_assert!(r.start_one(&mut reactor, fd, StreamName::Stdout, pid).is_ok());
                }
                Op::Stop(fd) => {
                    r.stop_one(&mut reactor, fd);
                    prop_assert!(!r.is_active(fd));
                }
                Op::ReactorForgets(fd) => reactor.forget_registration(fd),
                Op::ReactorClosed(fd) => reactor.fail_unregister_with_ebadf(fd),
            }

            // The reactor never watches a descriptor the redirector does not
            // know about.
            let active: BTreeSet<i32> = r.active_fds().into_iter().collect();
            for fd in reactor.registered_fds() {
                prop_assert!(active.contains(&fd));
            }
        }

        r.stop(&mut reactor);
        prop_assert!(reactor.registered_fds().is_empty());
    }
}
