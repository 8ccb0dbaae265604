//! Service-level tests against the scripted backend.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rstest::rstest;

use super::support::{
    BackendGate, FAKE_VERSION, GateMode, Harness, auto_restart_config, eventually, fake_backend,
    harness, request, test_config, versionless_backend,
};
use crate::errors::{DispatchError, ReadinessError, SupervisorError};
use crate::events::LifecycleEvent;
use crate::process::SpawnConfig;
use crate::readiness::ReadinessPolicy;
use crate::request::{DiagnosticSeverity, Operation, VerificationStatus};
use crate::service::probe_version;
use crate::supervisor::{RestartPolicy, SupervisorState};

const WAIT: Duration = Duration::from_secs(10);

#[rstest]
fn start_handshakes_and_goes_idle(harness: Harness) {
    assert_eq!(harness.service.state(), SupervisorState::Idle);
    assert!(harness.service.is_running());
    assert_eq!(
        harness.service.version().map(|version| version.to_string()),
        Some(FAKE_VERSION.to_owned())
    );
    assert_eq!(
        harness.reporter.events(),
        vec![
            LifecycleEvent::ServerStarting,
            LifecycleEvent::ServerUp {
                version: FAKE_VERSION.to_owned(),
            },
        ]
    );
}

#[rstest]
fn requests_are_answered_in_submission_order(harness: Harness) {
    let pending: Vec<_> = (0..5)
        .map(|index| {
            harness
                .service
                .submit(&request(&format!("doc-{index}"), Operation::Verify))
                .expect("submit")
        })
        .collect();

    let results: Vec<_> = pending
        .into_iter()
        .map(|handle| handle.wait().expect("result"))
        .collect();

    assert_eq!(results.len(), 5);
    for (index, result) in results.iter().enumerate() {
        assert!(
            result.output.contains(&format!("doc-{index}")),
            "result {index} answered the wrong request: {}",
            result.output
        );
        assert_eq!(result.status, VerificationStatus::Verified);
    }
    assert!(results.windows(2).all(|pair| match pair {
        [first, second] => first.sequence < second.sequence,
        _ => false,
    }));
    assert_eq!(harness.service.stats().completed, 5);
    assert_eq!(harness.service.state(), SupervisorState::Idle);
}

#[rstest]
fn concurrent_callers_each_get_their_own_answer(harness: Harness) {
    let service = &harness.service;

    thread::scope(|scope| {
        for caller in 0..4 {
            scope.spawn(move || {
                for turn in 0..3 {
                    let text = format!("caller-{caller}-turn-{turn}");
                    let result = service
                        .submit(&request(&text, Operation::Verify))
                        .expect("submit")
                        .wait()
                        .expect("result");
                    assert!(result.output.contains(&text));
                    assert!(!result.crashed);
                }
            });
        }
    });

    assert_eq!(service.stats().completed, 12);
    assert_eq!(service.stats().desyncs, 0);
}

fn reply_number(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("reply "))
        .and_then(|number| number.parse().ok())
}

#[rstest]
fn concurrent_submissions_are_numbered_in_queue_order(harness: Harness) {
    let service = &harness.service;
    let answered = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for caller in 0..8 {
            let answered = &answered;
            scope.spawn(move || {
                let handles: Vec<_> = (0..5)
                    .map(|turn| {
                        let text = format!("caller-{caller}-turn-{turn}");
                        service
                            .submit(&request(&text, Operation::Verify))
                            .expect("submit")
                    })
                    .collect();
                for handle in handles {
                    let result = handle.wait().expect("result");
                    let reply = reply_number(&result.output).expect("reply number");
                    answered.lock().expect("answers").push((result.sequence, reply));
                }
            });
        }
    });

    let mut answered = answered.into_inner().expect("answers");
    answered.sort_unstable();
    assert_eq!(answered.len(), 40);
    // The backend numbers answers in the order requests reached it.
    assert!(
        answered.windows(2).all(|pair| match pair {
            [first, second] => first.1 < second.1,
            _ => false,
        }),
        "sequence order differs from write order: {answered:?}"
    );
}

#[rstest]
fn failure_marker_yields_failed(harness: Harness) {
    let result = harness
        .service
        .submit(&request("FAIL-ME", Operation::Compile))
        .expect("submit")
        .wait()
        .expect("result");

    assert_eq!(result.status, VerificationStatus::Failed);
    assert_eq!(result.output, "parse error near lemma");
    assert!(!result.crashed);
}

#[rstest]
fn reported_errors_yield_not_verified(harness: Harness) {
    let result = harness
        .service
        .submit(&request("ERRORS-ME", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");

    assert_eq!(result.status, VerificationStatus::NotVerified);
    assert_eq!(result.proof_obligations, 2);
    assert_eq!(result.errors, 1);
    assert_eq!(
        result.diagnostics.first().map(|diagnostic| diagnostic.severity),
        Some(DiagnosticSeverity::Error)
    );
}

#[rstest]
fn counter_example_carries_the_model(harness: Harness) {
    let result = harness
        .service
        .submit(&request("lemma Model()", Operation::CounterExample))
        .expect("submit")
        .wait()
        .expect("result");

    let model = result.counter_model.expect("counter model");
    assert!(model.starts_with("seen counterExample "));
}

#[rstest]
fn crash_resolves_in_flight_and_refuses_new_work(harness: Harness) {
    let result = harness
        .service
        .submit(&request("CRASH-ME", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");

    assert!(result.crashed);
    assert_eq!(result.status, VerificationStatus::Failed);
    assert_eq!(harness.service.state(), SupervisorState::Crashed);
    assert!(!harness.service.is_running());
    assert!(
        harness
            .reporter
            .saw(&LifecycleEvent::BackendCrashed { exit_code: Some(3) })
    );
    assert!(matches!(
        harness.service.submit(&request("again", Operation::Verify)),
        Err(DispatchError::NotReady {
            state: SupervisorState::Crashed
        })
    ));
}

#[rstest]
fn clean_exit_mid_request_stops_without_crash_report(harness: Harness) {
    let result = harness
        .service
        .submit(&request("EXIT-ME", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");

    assert!(result.crashed);
    assert_eq!(harness.service.state(), SupervisorState::Stopped);
    assert!(harness.reporter.saw(&LifecycleEvent::ServerDown));
    assert!(
        !harness
            .reporter
            .events()
            .iter()
            .any(|event| matches!(event, LifecycleEvent::BackendCrashed { .. }))
    );
}

#[rstest]
fn exit_is_noticed_while_a_forked_child_holds_stdout(harness: Harness) {
    let pending = harness
        .service
        .submit(&request("ORPHAN-ME", Operation::Verify))
        .expect("submit");

    // The forked child keeps stdout open for five seconds.
    let result = pending
        .wait_timeout(Duration::from_secs(3))
        .expect("answered before stdout closes");

    assert!(result.crashed);
    assert_eq!(harness.service.state(), SupervisorState::Crashed);
    assert!(!harness.service.is_running());
    assert!(
        harness
            .reporter
            .saw(&LifecycleEvent::BackendCrashed { exit_code: Some(3) })
    );
}

#[rstest]
fn auto_restart_recovers_after_crash() {
    let harness = Harness::started(auto_restart_config(3));

    let crashed = harness
        .service
        .submit(&request("CRASH-ME", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");
    assert!(crashed.crashed);

    harness.service.await_ready().expect("backend restarted");
    let result = harness
        .service
        .submit(&request("after restart", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");

    assert_eq!(result.status, VerificationStatus::Verified);
    assert!(
        harness
            .reporter
            .saw(&LifecycleEvent::ServerCrashedRestarting { attempt: 1 })
    );
}

#[rstest]
fn restarts_are_bounded() {
    let config = test_config(fake_backend()).with_restart(RestartPolicy {
        auto_restart: false,
        max_retries: 1,
    });
    let harness = Harness::started(config);

    harness.service.restart().expect("first restart");
    let refused = harness.service.restart();

    assert!(matches!(
        refused,
        Err(SupervisorError::RetriesExhausted { attempts: 1 })
    ));
    assert!(
        harness
            .reporter
            .saw(&LifecycleEvent::MaxRetriesReached { attempts: 1 })
    );
    // The process from the successful restart is still serving.
    assert_eq!(harness.service.state(), SupervisorState::Idle);
}

#[rstest]
fn explicit_start_resets_the_restart_budget() {
    let config = test_config(fake_backend()).with_restart(RestartPolicy {
        auto_restart: false,
        max_retries: 1,
    });
    let harness = Harness::started(config);
    harness.service.restart().expect("restart");
    harness.service.stop();

    harness.service.start().expect("start again");

    assert!(harness.service.restart().is_ok());
}

#[rstest]
fn restart_before_start_is_not_configured() {
    let harness = Harness::new(test_config(fake_backend()));

    assert!(matches!(
        harness.service.restart(),
        Err(SupervisorError::NotConfigured)
    ));
}

#[rstest]
fn start_twice_is_refused(harness: Harness) {
    assert!(matches!(
        harness.service.start(),
        Err(SupervisorError::AlreadyRunning)
    ));
}

#[rstest]
fn stop_resolves_in_flight_and_rejects_queued(harness: Harness) {
    let hanging = harness
        .service
        .submit(&request("HANG-ME", Operation::Verify))
        .expect("submit");
    let queued = harness
        .service
        .submit(&request("behind", Operation::Verify))
        .expect("submit");
    assert!(eventually(WAIT, || harness.service.state() == SupervisorState::Busy));

    harness.service.stop();

    let result = hanging.wait().expect("result");
    assert!(result.crashed);
    assert!(matches!(
        queued.wait(),
        Err(DispatchError::NotReady {
            state: SupervisorState::Stopped
        })
    ));
    assert_eq!(harness.service.state(), SupervisorState::Stopped);
    assert!(!harness.service.is_running());
}

#[rstest]
fn failed_restart_refuses_work_queued_behind_it() {
    let gate = BackendGate::new();
    let harness = Harness::started(test_config(gate.spawn_config()));
    let held = harness
        .service
        .submit(&request("HOLD-ME", Operation::Verify))
        .expect("submit");
    let queued = harness
        .service
        .submit(&request("behind", Operation::Verify))
        .expect("submit");
    assert!(eventually(WAIT, || harness.service.state() == SupervisorState::Busy));
    gate.set(GateMode::Refuse);

    let restarted = harness.service.restart();

    assert!(matches!(restarted, Err(SupervisorError::Handshake { .. })));
    assert!(held.wait_timeout(WAIT).expect("result").crashed);
    assert!(matches!(
        queued.wait_timeout(WAIT),
        Err(DispatchError::NotReady {
            state: SupervisorState::Crashed
        })
    ));
    assert_eq!(harness.service.state(), SupervisorState::Crashed);
    assert!(eventually(WAIT, || harness.service.stats().queue_depth == 0));
    assert!(
        harness
            .reporter
            .events()
            .iter()
            .any(|event| matches!(event, LifecycleEvent::StartFailed { .. }))
    );
}

#[rstest]
fn stop_during_restart_handshake_refuses_queued_work() {
    let gate = BackendGate::new();
    let harness = Harness::started(test_config(gate.spawn_config()));
    let held = harness
        .service
        .submit(&request("HOLD-ME", Operation::Verify))
        .expect("submit");
    let queued = harness
        .service
        .submit(&request("behind", Operation::Verify))
        .expect("submit");
    assert!(eventually(WAIT, || harness.service.state() == SupervisorState::Busy));
    gate.set(GateMode::Stall);

    thread::scope(|scope| {
        let restarting = scope.spawn(|| harness.service.restart());
        assert!(eventually(WAIT, || {
            harness.service.state() == SupervisorState::Starting
        }));

        harness.service.stop();

        // Answered while the new backend is still handshaking.
        assert!(matches!(
            queued.wait_timeout(Duration::from_secs(1)),
            Err(DispatchError::NotReady {
                state: SupervisorState::Stopped
            })
        ));
        let restarted = restarting.join().expect("restart thread");
        assert!(matches!(restarted, Err(SupervisorError::StartInterrupted)));
    });

    assert!(held.wait_timeout(WAIT).expect("result").crashed);
    assert_eq!(harness.service.state(), SupervisorState::Stopped);
    assert!(!harness.service.is_running());
    assert!(harness.reporter.saw(&LifecycleEvent::ServerDown));
}

#[rstest]
fn stop_without_process_is_a_no_op() {
    let harness = Harness::new(test_config(fake_backend()));

    harness.service.stop();
    harness.service.stop();

    assert_eq!(harness.service.state(), SupervisorState::Stopped);
    assert!(harness.reporter.events().is_empty());
}

#[rstest]
fn missing_binary_fails_start() {
    let harness = Harness::new(test_config(SpawnConfig::new(
        "/nonexistent/proofwire/verification-server",
    )));

    let outcome = harness.service.start();

    assert!(matches!(outcome, Err(SupervisorError::BinaryNotFound { .. })));
    assert_eq!(harness.service.state(), SupervisorState::Stopped);
    assert!(
        harness
            .reporter
            .events()
            .iter()
            .any(|event| matches!(event, LifecycleEvent::StartFailed { .. }))
    );
}

#[rstest]
fn backend_without_version_fails_handshake() {
    let harness = Harness::new(test_config(versionless_backend()));

    let outcome = harness.service.start();

    assert!(matches!(outcome, Err(SupervisorError::Handshake { .. })));
    assert!(!harness.service.is_running());
}

#[rstest]
fn unsolicited_frames_are_counted_as_desyncs(harness: Harness) {
    let result = harness
        .service
        .submit(&request("DOUBLE-ME", Operation::Verify))
        .expect("submit")
        .wait()
        .expect("result");

    assert_eq!(result.status, VerificationStatus::Verified);
    assert!(eventually(WAIT, || harness.service.stats().desyncs == 1));
}

#[rstest]
fn version_probe_is_served_from_the_handshake(harness: Harness) {
    let result = harness
        .service
        .submit(&request("", Operation::VersionProbe))
        .expect("submit")
        .wait()
        .expect("result");

    assert_eq!(result.output, FAKE_VERSION);
    assert_eq!(harness.service.stats().completed, 0);
}

#[rstest]
fn submit_before_start_is_not_ready() {
    let harness = Harness::new(test_config(fake_backend()));

    assert!(matches!(
        harness.service.submit(&request("early", Operation::Verify)),
        Err(DispatchError::NotReady {
            state: SupervisorState::Stopped
        })
    ));
}

#[rstest]
fn readiness_times_out_when_never_started() {
    let harness = Harness::new(test_config(fake_backend()));
    let policy = ReadinessPolicy::new(Duration::from_millis(10), 3);

    assert_eq!(
        harness.service.await_ready_with(policy),
        Err(ReadinessError::Timeout {
            attempts: 3,
            poll_interval: Duration::from_millis(10),
        })
    );
}

#[rstest]
fn wait_timeout_leaves_request_outstanding(harness: Harness) {
    let pending = harness
        .service
        .submit(&request("HANG-ME", Operation::Verify))
        .expect("submit");
    assert!(eventually(WAIT, || harness.service.state() == SupervisorState::Busy));

    assert!(matches!(
        pending.wait_timeout(Duration::from_millis(50)),
        Err(DispatchError::TimedOut { .. })
    ));

    harness.service.stop();
    assert!(pending.wait().expect("result").crashed);
}

#[rstest]
fn probe_version_uses_a_throwaway_process() {
    let version = probe_version(&test_config(fake_backend())).expect("probe");

    assert_eq!(version.as_str(), FAKE_VERSION);
}
