// Integration tests for the container manager's lifecycle state machine,
// driven through a fake engine that runs a real child process group.

mod fixtures;

use anyhow::Result;
use fixtures::*;
use nix::unistd::Pid;
use rstest::*;
use sessiond::container::android::AndroidTermination;
use sessiond::container::{ContainerManager, TeardownMode};
use sessiond::jobs::{ExitStatus, JobManager, TerminationKind};
use sessiond::util::{process_group_gone, wait_for_process_group_exit};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn exit_status_for(pid: Pid) -> ExitStatus {
    ExitStatus {
        pid,
        kind: TerminationKind::Killed,
        status: libc::SIGKILL,
    }
}

struct StartedManager {
    manager: ContainerManager,
    callbacks: Arc<Mutex<Vec<(Pid, bool)>>>,
    counters: Arc<fixtures::EngineCounters>,
}

fn start_manager(engine: FakeEngine) -> StartedManager {
    let dir = scratch_dir("container");
    write_container_documents(&dir);
    let counters = engine.counters.clone();
    let mut manager = ContainerManager::new(
        Box::new(engine),
        "testc",
        &dir,
        "session_manager_containers",
    )
    .expect("valid manager");

    let callbacks: Arc<Mutex<Vec<(Pid, bool)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let recorded = callbacks.clone();
    manager
        .start(Box::new(move |pid, clean| {
            recorded.lock().expect("lock callbacks").push((pid, clean));
        }))
        .expect("start succeeds");

    StartedManager {
        manager,
        callbacks,
        counters,
    }
}

#[rstest]
fn test_start_records_pid_and_instance_id() {
    let mut started = start_manager(FakeEngine::new());
    let pid = started.manager.current_pid().expect("running pid");
    assert!(started.manager.is_running());
    assert!(started.manager.instance_id().is_some());
    assert!(started.manager.is_managed_job(pid));
    assert!(!started.manager.is_managed_job(Pid::from_raw(1)));
    assert_eq!(started.counters.creates.load(Ordering::SeqCst), 1);

    started.manager.ensure_job_exit(Duration::from_millis(100));
    assert!(!started.manager.is_running());
}

#[rstest]
fn test_second_start_while_running_fails() {
    let mut started = start_manager(FakeEngine::new());
    let result = started.manager.start(Box::new(|_, _| {}));
    let message = result.expect_err("second start must fail").to_string();
    assert!(message.contains("already running"));

    started.manager.ensure_job_exit(Duration::from_millis(100));
}

#[rstest]
fn test_start_failure_retains_no_state() {
    let dir = scratch_dir("container");
    write_container_documents(&dir);
    let mut manager = ContainerManager::new(
        Box::new(FakeEngine::failing_start(-libc::EINVAL)),
        "testc",
        &dir,
        "session_manager_containers",
    )
    .expect("valid manager");

    let result = manager.start(Box::new(|_, _| {}));
    assert!(result.is_err());
    assert!(!manager.is_running());
    assert!(manager.current_pid().is_none());
    assert!(manager.instance_id().is_none());
}

#[rstest]
fn test_start_fails_on_missing_config_documents() {
    let dir = scratch_dir("container");
    // No documents written.
    let mut manager = ContainerManager::new(
        Box::new(FakeEngine::new()),
        "testc",
        &dir,
        "session_manager_containers",
    )
    .expect("valid manager");

    let result = manager.start(Box::new(|_, _| {}));
    let message = format!("{:#}", result.expect_err("start must fail"));
    assert!(message.contains("config.json"));
    assert!(!manager.is_running());
}

#[rstest]
fn test_invalid_container_name_is_rejected() {
    let dir = scratch_dir("container");
    let result = ContainerManager::new(
        Box::new(FakeEngine::new()),
        "bad name!",
        &dir,
        "session_manager_containers",
    );
    assert!(result.is_err());
}

#[rstest]
fn test_requested_exit_is_clean() {
    let mut started = start_manager(FakeEngine::new());
    let pid = started.manager.current_pid().expect("running pid");

    started.manager.request_job_exit("session ended");
    assert_eq!(started.counters.kills.load(Ordering::SeqCst), 1);
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));

    started.manager.handle_exit(&exit_status_for(pid));
    let callbacks = started.callbacks.lock().expect("lock callbacks");
    assert_eq!(callbacks.as_slice(), &[(pid, true)]);
    assert!(!started.manager.is_running());
    assert_eq!(started.counters.waits.load(Ordering::SeqCst), 1);
}

#[rstest]
fn test_unrequested_exit_is_unclean() {
    let mut started = start_manager(FakeEngine::new());
    let pid = started.manager.current_pid().expect("running pid");

    // The container dies on its own.
    sessiond::util::kill_process_group(pid);
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));

    started.manager.handle_exit(&exit_status_for(pid));
    let callbacks = started.callbacks.lock().expect("lock callbacks");
    assert_eq!(callbacks.as_slice(), &[(pid, false)]);
}

#[rstest]
fn test_handle_exit_is_idempotent() {
    let mut started = start_manager(FakeEngine::new());
    let pid = started.manager.current_pid().expect("running pid");

    started.manager.request_job_exit("shutdown");
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));
    started.manager.handle_exit(&exit_status_for(pid));
    // A spurious second notification must not double-clean or re-fire the
    // callback.
    started.manager.handle_exit(&exit_status_for(pid));

    assert_eq!(started.callbacks.lock().expect("lock").len(), 1);
    assert_eq!(started.counters.waits.load(Ordering::SeqCst), 1);
}

#[rstest]
fn test_ensure_job_exit_escalates_once_after_timeout() {
    // The engine's kill is ignored, so only the forced process-group kill
    // can take the container down.
    let mut started = start_manager(FakeEngine::ignoring_kill());
    let pid = started.manager.current_pid().expect("running pid");

    started.manager.request_job_exit("shutdown");
    assert!(!process_group_gone(pid));

    let begin = Instant::now();
    started.manager.ensure_job_exit(Duration::from_millis(200));
    let elapsed = begin.elapsed();

    // Polled for the full timeout, then escalated without re-polling.
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));
    assert!(!started.manager.is_running());
    assert_eq!(started.callbacks.lock().expect("lock").len(), 1);

    // The reaped exit that follows the forced kill must be a no-op now.
    started.manager.handle_exit(&exit_status_for(pid));
    assert_eq!(started.callbacks.lock().expect("lock").len(), 1);
}

#[rstest]
fn test_stateless_teardown_skips_engine_kill() {
    let mut started = start_manager(FakeEngine::ignoring_kill());
    started.manager.set_teardown_mode(TeardownMode::Stateless);
    let pid = started.manager.current_pid().expect("running pid");

    started.manager.request_job_exit("login screen teardown");
    // The engine kill would be ignored; the stateless path kills the
    // process group directly.
    assert_eq!(started.counters.kills.load(Ordering::SeqCst), 0);
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));

    started.manager.handle_exit(&exit_status_for(pid));
    assert_eq!(
        started.callbacks.lock().expect("lock").as_slice(),
        &[(pid, true)]
    );
}

#[rstest]
fn test_android_clean_stop_writes_shutdown_metric() -> Result<()> {
    let dir = scratch_dir("android");
    write_container_documents(&dir);
    let metrics_path = dir.join("android_shutdown_time_ms");
    // A shell that does not exist: the property-set spawn fails (and is
    // logged), but the shutdown timestamp is still recorded.
    let missing_shell = dir.join("no-such-android-sh");

    let engine = FakeEngine::new();
    let mut manager = ContainerManager::new(
        Box::new(engine),
        "android-testc",
        &dir,
        "session_manager_containers",
    )?
    .with_strategy(Box::new(AndroidTermination::with_paths(
        &missing_shell,
        &metrics_path,
    )));

    manager.start(Box::new(|_, _| {}))?;
    let pid = manager.current_pid().expect("running pid");

    let begin = Instant::now();
    manager.request_job_exit("shutdown");
    std::thread::sleep(Duration::from_millis(60));
    sessiond::util::kill_process_group(pid);
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));
    manager.handle_exit(&exit_status_for(pid));
    let upper_bound_ms = begin.elapsed().as_millis();

    let written = std::fs::read_to_string(&metrics_path)?;
    let written_ms: u128 = written.trim().parse()?;
    assert!(written_ms >= 60, "wrote {} ms", written_ms);
    assert!(
        written_ms <= upper_bound_ms,
        "wrote {} ms, elapsed only {} ms",
        written_ms,
        upper_bound_ms
    );
    Ok(())
}

#[rstest]
fn test_android_unclean_stop_writes_no_metric() -> Result<()> {
    let dir = scratch_dir("android");
    write_container_documents(&dir);
    let metrics_path = dir.join("android_shutdown_time_ms");
    let missing_shell = dir.join("no-such-android-sh");

    let mut manager = ContainerManager::new(
        Box::new(FakeEngine::new()),
        "android-testc",
        &dir,
        "session_manager_containers",
    )?
    .with_strategy(Box::new(AndroidTermination::with_paths(
        &missing_shell,
        &metrics_path,
    )));

    manager.start(Box::new(|_, _| {}))?;
    let pid = manager.current_pid().expect("running pid");

    // No termination request: the container just dies.
    sessiond::util::kill_process_group(pid);
    assert!(wait_for_process_group_exit(pid, Duration::from_secs(5)));
    manager.handle_exit(&exit_status_for(pid));

    assert!(!metrics_path.exists());
    Ok(())
}
