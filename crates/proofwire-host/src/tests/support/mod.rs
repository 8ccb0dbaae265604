//! Shared fixtures: a scripted `sh` backend and a recording reporter.

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rstest::fixture;
use tempfile::TempDir;
use url::Url;

use crate::config::BackendConfig;
use crate::events::{LifecycleEvent, LifecycleReporter};
use crate::process::SpawnConfig;
use crate::readiness::ReadinessPolicy;
use crate::request::{DocumentSnapshot, Operation, VerificationRequest};
use crate::service::VerificationService;
use crate::supervisor::RestartPolicy;

/// Version the scripted backend reports.
pub const FAKE_VERSION: &str = "1.2.3";

/// A backend speaking the wire protocol. Document text selects behaviour:
/// `CRASH-ME` exits with status 3, `ORPHAN-ME` exits with status 3 while a
/// background child keeps stdout open, `EXIT-ME` exits cleanly, `HANG-ME`
/// stalls, `FAIL-ME` answers with the failure marker, `ERRORS-ME` reports one
/// error, and `DOUBLE-ME` answers twice. Anything else is echoed back with
/// the number of answers so far and verified.
const FAKE_BACKEND: &str = r#"
n=0
while IFS= read -r line; do
  case "$line" in
    version) printf 'VERSION:1.2.3\nSUCCESS-MARKER\n' ;;
    quit) exit 0 ;;
    *CRASH-ME*) printf 'Unhandled exception: boom\n'; exit 3 ;;
    *ORPHAN-ME*) sleep 5 & exit 3 ;;
    *EXIT-ME*) exit 0 ;;
    *HANG-ME*) sleep 3; printf 'errorCount=0\nSUCCESS-MARKER\n' ;;
    *FAIL-ME*) printf 'parse error near lemma\nFAILURE-MARKER\n' ;;
    *ERRORS-ME*) printf 'a.dfy(1,2): Error: assertion might not hold\nproofObligationCount=2 errorCount=1\nSUCCESS-MARKER\n' ;;
    *DOUBLE-ME*) printf 'errorCount=0\nSUCCESS-MARKER\nerrorCount=0\nSUCCESS-MARKER\n' ;;
    *) n=$((n + 1)); printf 'seen %s\nreply %d\nerrorCount=0\nSUCCESS-MARKER\n' "$line" "$n" ;;
  esac
done
"#;

/// A backend whose handshake is controlled by flag files next to `$1`:
/// `$1.refuse` makes it exit instead of reporting a version and `$1.stall`
/// delays the version by two seconds. `HOLD-ME` blocks until the next line.
const GATED_BACKEND: &str = r#"
gate="$1"
while IFS= read -r line; do
  case "$line" in
    version)
      [ -e "$gate.refuse" ] && exit 0
      [ -e "$gate.stall" ] && sleep 2
      printf 'VERSION:1.2.3\nSUCCESS-MARKER\n' ;;
    quit) exit 0 ;;
    *HOLD-ME*) IFS= read -r _ ;;
    *) printf 'seen %s\nerrorCount=0\nSUCCESS-MARKER\n' "$line" ;;
  esac
done
"#;

/// A backend that never reports a version.
const VERSIONLESS_BACKEND: &str = r#"
while IFS= read -r line; do
  [ "$line" = quit ] && exit 0
  printf 'unknown command\nFAILURE-MARKER\n'
done
"#;

/// Spawn settings for the scripted backend.
#[must_use]
pub fn fake_backend() -> SpawnConfig {
    SpawnConfig::new("sh").with_args(["-c", FAKE_BACKEND])
}

/// Spawn settings for a backend that fails the handshake.
#[must_use]
pub fn versionless_backend() -> SpawnConfig {
    SpawnConfig::new("sh").with_args(["-c", VERSIONLESS_BACKEND])
}

/// How the next handshake of a [`BackendGate`] backend behaves.
#[derive(Debug, Clone, Copy)]
pub enum GateMode {
    /// Exit before reporting a version.
    Refuse,
    /// Report the version after a delay.
    Stall,
}

/// Flag files steering a gated backend, removed on drop.
pub struct BackendGate {
    dir: TempDir,
}

impl BackendGate {
    /// A gate with every flag clear.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    /// Spawn settings for a backend watching this gate.
    pub fn spawn_config(&self) -> SpawnConfig {
        let gate = self.dir.path().join("gate");
        SpawnConfig::new("sh").with_args([
            String::from("-c"),
            String::from(GATED_BACKEND),
            String::from("sh"),
            gate.to_string_lossy().into_owned(),
        ])
    }

    /// Raises a flag that affects every later handshake.
    pub fn set(&self, mode: GateMode) {
        let flag = match mode {
            GateMode::Refuse => "gate.refuse",
            GateMode::Stall => "gate.stall",
        };
        fs::write(self.dir.path().join(flag), b"").expect("raise gate flag");
    }
}

impl Default for BackendGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Fast timings for tests.
#[must_use]
pub fn test_config(spawn: SpawnConfig) -> BackendConfig {
    BackendConfig::new(spawn)
        .with_stop_grace(Duration::from_millis(200))
        .with_handshake_timeout(Duration::from_secs(5))
        .with_readiness(ReadinessPolicy::new(Duration::from_millis(20), 250))
}

/// Test configuration with automatic restarts.
#[must_use]
pub fn auto_restart_config(max_retries: u32) -> BackendConfig {
    test_config(fake_backend()).with_restart(RestartPolicy {
        auto_restart: true,
        max_retries,
    })
}

/// Records every lifecycle event.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingReporter {
    /// Events seen so far.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether `event` was reported.
    pub fn saw(&self, event: &LifecycleEvent) -> bool {
        self.events().contains(event)
    }
}

impl LifecycleReporter for RecordingReporter {
    fn report(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

/// A service over the scripted backend plus its event log.
pub struct Harness {
    /// Service under test.
    pub service: VerificationService,
    /// Events reported by the service.
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    /// Builds a service without starting it.
    pub fn new(config: BackendConfig) -> Self {
        let reporter = Arc::new(RecordingReporter::default());
        let service =
            VerificationService::new(config, Arc::clone(&reporter)).expect("build service");
        Self { service, reporter }
    }

    /// Builds and starts a service over the scripted backend.
    pub fn started(config: BackendConfig) -> Self {
        let harness = Self::new(config);
        harness.service.start().expect("start backend");
        harness
    }
}

/// A started service over the scripted backend.
#[fixture]
pub fn harness() -> Harness {
    Harness::started(test_config(fake_backend()))
}

/// A document with the given text.
pub fn document(text: &str) -> DocumentSnapshot {
    let uri = Url::parse("file:///work/a.dfy").expect("valid test URI");
    DocumentSnapshot::new(uri, 1, text)
}

/// A request for `text`.
pub fn request(text: &str, operation: Operation) -> VerificationRequest {
    VerificationRequest::new(document(text), operation)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
