use std::sync::Arc;
use std::time::Duration;

use docker_ext::builder::{PortMapping, RestartPolicy};
use docker_ext::runtime::memory::RuntimeCall;
use docker_ext::{
    ContainerSnapshot, ContainerSpec, ContainerState, ErrorKind, ImageReference, InMemoryRuntime,
    RuntimeError, UpdateError, UpdateOrchestrator, UpdateStatus,
};

const TIMEOUT: Duration = Duration::from_millis(50);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn web_snapshot() -> ContainerSnapshot {
    ContainerSpec::new("app:1", "web")
        .with_port(PortMapping::tcp(8080).with_host_port(80))
        .with_volume("/srv/data", "/data")
        .with_env("MODE", "prod")
        .with_extra_host("db.internal", "10.0.0.7")
        .with_restart_policy(RestartPolicy::on_failure(3))
        .build(None)
        .unwrap()
}

fn setup() -> (Arc<InMemoryRuntime>, UpdateOrchestrator<InMemoryRuntime>) {
    init_logging();
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.insert(web_snapshot(), ContainerState::Running);
    let orchestrator =
        UpdateOrchestrator::from_arc(Arc::clone(&runtime)).with_poll_interval(Duration::from_millis(5));
    (runtime, orchestrator)
}

fn only_container(runtime: &InMemoryRuntime) -> (ContainerSnapshot, ContainerState) {
    let mut containers = runtime.containers_named("web");
    assert_eq!(containers.len(), 1, "expected exactly one `web` container");
    containers.remove(0)
}

#[tokio::test]
async fn update_to_new_image_succeeds() {
    let (runtime, orchestrator) = setup();

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::Succeeded);
    assert_eq!(outcome.final_image, Some(ImageReference::new("app", "2")));
    assert!(outcome.error.is_none());

    let (snapshot, state) = only_container(&runtime);
    assert_eq!(state, ContainerState::Running);
    assert_eq!(snapshot, web_snapshot().with_image(&"app:2".parse().unwrap()));
}

#[tokio::test]
async fn same_image_update_still_recreates() {
    let (runtime, orchestrator) = setup();

    let outcome = orchestrator.update("web", "app:1", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::Succeeded);
    assert_eq!(outcome.final_image, Some(ImageReference::new("app", "1")));
    assert_eq!(runtime.remove_count(), 1);
    assert_eq!(runtime.created().len(), 1);
    only_container(&runtime);
}

#[tokio::test]
async fn force_flag_is_passed_to_remove() {
    let (runtime, orchestrator) = setup();

    orchestrator.update("web", "app:2", false, TIMEOUT).await;

    assert!(runtime
        .calls()
        .iter()
        .any(|c| matches!(c, RuntimeCall::Remove { force: false, .. })));
    assert!(!runtime
        .calls()
        .iter()
        .any(|c| matches!(c, RuntimeCall::Remove { force: true, .. })));
}

#[tokio::test]
async fn container_that_never_runs_is_rolled_back() {
    let (runtime, orchestrator) = setup();
    runtime.never_running("app:2");

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::RolledBack);
    assert_eq!(outcome.final_image, Some(ImageReference::new("app", "1")));
    assert_eq!(outcome.error.as_ref().map(UpdateError::kind), Some(ErrorKind::NotRunning));

    let (snapshot, state) = only_container(&runtime);
    assert_eq!(state, ContainerState::Running);
    assert_eq!(snapshot, web_snapshot());
    assert_eq!(snapshot.binds(), ["/srv/data:/data".to_owned()]);
    assert_eq!(snapshot.exposed_ports(), ["8080/tcp"]);
}

#[tokio::test]
async fn unavailable_image_is_rolled_back() {
    let (runtime, orchestrator) = setup();
    runtime.fail_create("app:2", RuntimeError::ImageUnavailable("pull access denied".into()));

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::RolledBack);
    assert_eq!(
        outcome.error.as_ref().map(UpdateError::kind),
        Some(ErrorKind::ImageUnavailable)
    );
    assert_eq!(only_container(&runtime).0, web_snapshot());
}

#[tokio::test]
async fn start_failure_is_rolled_back() {
    let (runtime, orchestrator) = setup();
    runtime.fail_start("app:2", RuntimeError::Unavailable("daemon restarting".into()));

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::RolledBack);
    assert_eq!(
        outcome.error.as_ref().map(UpdateError::kind),
        Some(ErrorKind::RuntimeUnavailable)
    );
    // the created-but-failed replacement was removed before the rollback create
    assert_eq!(runtime.remove_count(), 2);
    assert_eq!(only_container(&runtime).1, ContainerState::Running);
}

#[tokio::test]
async fn missing_container_short_circuits() {
    let (runtime, orchestrator) = setup();

    let outcome = orchestrator.update("missing", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::Failed);
    assert_eq!(outcome.final_image, None);
    assert_eq!(outcome.error.as_ref().map(UpdateError::kind), Some(ErrorKind::NotFound));
    assert_eq!(runtime.remove_count(), 0);
    assert!(runtime.created().is_empty());
    assert_eq!(
        runtime.calls(),
        vec![RuntimeCall::FindByName("missing".into())]
    );
}

#[tokio::test]
async fn rollback_uses_captured_snapshot_not_live_state() {
    let (runtime, orchestrator) = setup();
    runtime.never_running("app:2");
    // The engine rewrites the replacement's host config after creation.
    runtime.on_create(|snapshot| {
        if snapshot.image() != "app:2" {
            return snapshot;
        }
        let mut drifted = snapshot.host_config().clone();
        drifted.binds = Some(vec!["/tmp:/drift".into()]);
        drifted.extra_hosts = None;
        snapshot.with_host_config(drifted)
    });

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::RolledBack);
    let created = runtime.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1], web_snapshot());
    assert_eq!(only_container(&runtime).0, web_snapshot());
    // nothing inspected the drifted replacement
    let inspects = runtime
        .calls()
        .iter()
        .filter(|c| matches!(c, RuntimeCall::Inspect(_)))
        .count();
    assert_eq!(inspects, 1);
}

#[tokio::test]
async fn failed_rollback_reports_both_errors() {
    let (runtime, orchestrator) = setup();
    runtime.fail_create("app:2", RuntimeError::ImageUnavailable("app:2".into()));
    runtime.fail_create("app:1", RuntimeError::Unavailable("disk full".into()));

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    assert_eq!(outcome.status, UpdateStatus::Failed);
    assert!(outcome.needs_intervention());
    assert_eq!(outcome.final_image, None);

    let error = outcome.error.expect("failure carries an error");
    assert_eq!(error.kind(), ErrorKind::RollbackFailed);
    assert_eq!(error.original().map(UpdateError::kind), Some(ErrorKind::ImageUnavailable));
    assert_eq!(
        error.rollback().map(UpdateError::kind),
        Some(ErrorKind::RuntimeUnavailable)
    );
    // exactly one rollback attempt: forward create plus one rollback create
    assert_eq!(runtime.created().len(), 2);
    assert!(runtime.containers_named("web").is_empty());
}

#[tokio::test]
async fn remove_failure_surfaces_as_rollback_failure() {
    let (runtime, orchestrator) = setup();
    runtime.fail_remove(RuntimeError::PermissionDenied("read-only engine".into()));

    let outcome = orchestrator.update("web", "app:2", true, TIMEOUT).await;

    let error = outcome.error.expect("failure carries an error");
    assert_eq!(error.kind(), ErrorKind::RollbackFailed);
    assert_eq!(error.original().map(UpdateError::kind), Some(ErrorKind::PermissionDenied));
    assert!(runtime.created().is_empty());
    // the original container was never touched
    assert_eq!(only_container(&runtime).0, web_snapshot());
}

#[tokio::test]
async fn dropped_update_still_reaches_a_terminal_state() {
    let (runtime, orchestrator) = setup();
    runtime.never_running("app:2");

    let update = orchestrator.update("web", "app:2", true, Duration::from_millis(200));
    let cancelled = tokio::time::timeout(Duration::from_millis(20), update).await;
    assert!(cancelled.is_err());

    // the rollback lands on its own once verification gives up
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (snapshot, state) = only_container(&runtime);
    assert_eq!(snapshot, web_snapshot());
    assert_eq!(state, ContainerState::Running);
}

#[tokio::test]
async fn slow_starting_container_is_verified_by_polling() {
    let (runtime, orchestrator) = setup();
    runtime.running_after("app:2", 3);

    let outcome = orchestrator
        .update("web", "app:2", true, Duration::from_millis(500))
        .await;

    assert_eq!(outcome.status, UpdateStatus::Succeeded);
    assert_eq!(outcome.final_image, Some(ImageReference::new("app", "2")));
    let polls = runtime
        .calls()
        .iter()
        .filter(|c| matches!(c, RuntimeCall::IsInState(_, ContainerState::Running)))
        .count();
    assert_eq!(polls, 4);
    assert_eq!(runtime.created().len(), 1);
    assert_eq!(only_container(&runtime).1, ContainerState::Running);
}

#[tokio::test]
async fn unbounded_timeout_keeps_verifying_instead_of_dying() {
    let (runtime, orchestrator) = setup();
    runtime.never_running("app:2");

    let late_start = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        runtime.set_state("web", ContainerState::Running);
    };
    let (outcome, ()) = tokio::join!(
        orchestrator.update("web", "app:2", true, Duration::from_secs(u64::MAX)),
        late_start,
    );

    assert_eq!(outcome.status, UpdateStatus::Succeeded);
    assert!(outcome.error.is_none());
    let (snapshot, state) = only_container(&runtime);
    assert_eq!(snapshot.image(), "app:2");
    assert_eq!(state, ContainerState::Running);
}
