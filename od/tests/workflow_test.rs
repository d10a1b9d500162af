//! End-to-end tests for the onboarding workflow
//!
//! These drive the orchestrator through the request surface with simulated
//! collaborators and check what lands in the task ledger.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskstore::{DoState, ErrorUpdate, FileStorage, MemoryStorage, StatePersistence, TaskStatus};
use tempfile::TempDir;
use tokio::sync::broadcast;

use onboard::api::{ApiHandler, CORRELATION_HEADER, ORIGIN_HEADER, RestRequest, RestResponse};
use onboard::config::{Config, DelegationConfig, DeploymentMode, RebootConfig, StorageConfig};
use onboard::delegation::RequestSender;
use onboard::device::DeviceError;
use onboard::orchestrator::{Orchestrator, Recovery, RevokeEvent};
use onboard::processor::ProcessError;
use onboard::secrets::{PRIMARY_SECRET_ID, SECONDARY_SECRET_ID, SecretVault};
use onboard::sim::{RootPasswordCheck, ScriptedSender, SimHarness};
use onboard::state::{StateEvent, StateManager};

const DEVICE_ID: &str = "dev1";

struct Fixture {
    sim: SimHarness,
    storage: Arc<MemoryStorage>,
    orchestrator: Arc<Orchestrator>,
    api: ApiHandler,
}

fn config(deployment: DeploymentMode) -> Config {
    Config {
        deployment,
        delegation: DelegationConfig {
            url: Some("http://peer.example".to_string()),
            poll_interval_ms: 1,
            max_attempts: 5,
            ..DelegationConfig::default()
        },
        reboot: RebootConfig {
            settle_delay_ms: 0,
            probe_interval_ms: 1,
            probe_attempts: 3,
        },
        ..Config::default()
    }
}

fn start_with(deployment: DeploymentMode, state: DoState, peer: Option<Arc<dyn RequestSender>>) -> Fixture {
    let sim = SimHarness::new(DEVICE_ID);
    let storage = Arc::new(MemoryStorage::new());
    let manager = StateManager::spawn(state, storage.clone(), StorageConfig::default());
    let orchestrator = Orchestrator::start(config(deployment), manager, sim.collaborators(peer));
    let api = ApiHandler::new(orchestrator.clone(), "/onboard");
    Fixture {
        sim,
        storage,
        orchestrator,
        api,
    }
}

fn start(deployment: DeploymentMode) -> Fixture {
    start_with(deployment, DoState::default(), None)
}

fn declaration() -> Value {
    json!({
        "class": "Device",
        "schemaVersion": "1.0.0",
        "Common": {
            "hostname": "bigip1.example.com"
        }
    })
}

fn post(body: &Value) -> RestRequest {
    RestRequest {
        method: "POST".to_string(),
        path: "/onboard".to_string(),
        body: serde_json::to_vec(body).unwrap(),
        ..RestRequest::default()
    }
}

fn request(method: &str, path: &str) -> RestRequest {
    RestRequest {
        method: method.to_string(),
        path: path.to_string(),
        ..RestRequest::default()
    }
}

fn task_id(response: &RestResponse) -> String {
    response.body["id"].as_str().unwrap().to_string()
}

/// Drain result events already broadcast for `id`
fn drain_events(rx: &mut broadcast::Receiver<StateEvent>, id: &str) -> Vec<(Option<u16>, Option<TaskStatus>)> {
    let mut seen = Vec::new();
    while let Ok(StateEvent::ResultUpdated {
        id: event_id,
        code,
        status,
    }) = rx.try_recv()
    {
        if event_id == id {
            seen.push((code, status));
        }
    }
    seen
}

/// Wait for a result event with `status`
async fn wait_for_status(rx: &mut broadcast::Receiver<StateEvent>, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(StateEvent::ResultUpdated { status: Some(s), .. }) if s == status => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("Timed out waiting for status");
}

// =============================================================================
// Main flow
// =============================================================================

#[tokio::test]
async fn test_sync_request_succeeds() {
    let fx = start(DeploymentMode::Standalone);

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["result"]["status"], "OK");
    assert_eq!(response.body["result"]["message"], "success");
    assert_eq!(response.body["declaration"]["class"], "DO");
    assert_eq!(fx.sim.device.save_count(), 1);
    assert_eq!(fx.sim.processor.process_count(), 1);
    assert!(fx.sim.processor.rollback_targets().is_empty());
    assert!(fx.storage.save_count() > 0);

    let task = fx.orchestrator.state().get_task(&task_id(&response)).await.unwrap();
    assert_eq!(task.original_config, json!({"hostname": "sim.localdomain"}));
    assert!(!task.rollback_info.is_null());
}

#[tokio::test]
async fn test_most_recent_and_task_listing() {
    let fx = start(DeploymentMode::Standalone);
    let first = task_id(&fx.api.handle(post(&declaration())).await);
    let second = task_id(&fx.api.handle(post(&declaration())).await);

    let recent = fx.api.handle(request("GET", "/onboard")).await;
    assert_eq!(recent.status, 200);
    assert_eq!(task_id(&recent), second);

    let listing = fx.api.handle(request("GET", "/onboard/task")).await;
    let ids: Vec<&str> = listing.body.as_array().unwrap().iter().map(|t| t["id"].as_str().unwrap()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.as_str()));

    let one = fx.api.handle(request("GET", &format!("/onboard/task/{}", first))).await;
    assert_eq!(one.status, 200);
    assert_eq!(task_id(&one), first);

    let missing = fx.api.handle(request("GET", "/onboard/task/nope")).await;
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_async_request_answers_immediately() {
    let fx = start(DeploymentMode::Standalone);
    let mut events = fx.orchestrator.state().subscribe_events();
    let body = json!({"class": "DO", "async": true, "declaration": declaration()});

    let response = fx.api.handle(post(&body)).await;

    assert_eq!(response.status, 202);
    assert_eq!(response.body["result"]["status"], "RUNNING");
    wait_for_status(&mut events, TaskStatus::Ok).await;

    let task = fx.orchestrator.state().get_task(&task_id(&response)).await.unwrap();
    assert_eq!(task.result.code, Some(200));
}

#[tokio::test]
async fn test_unparsable_body_is_400() {
    let fx = start(DeploymentMode::Standalone);
    let req = RestRequest {
        body: b"{not json".to_vec(),
        ..post(&json!({}))
    };

    let response = fx.api.handle(req).await;

    assert_eq!(response.status, 400);
    assert_eq!(response.body["result"]["message"], "bad declaration");
    assert_eq!(response.body["result"]["errors"].as_array().unwrap().len(), 1);
    assert_eq!(fx.sim.processor.process_count(), 0);
}

#[tokio::test]
async fn test_invalid_declaration_is_400_with_validation_errors() {
    let fx = start(DeploymentMode::Standalone);

    let response = fx.api.handle(post(&json!({"class": "Device"}))).await;

    assert_eq!(response.status, 400);
    assert_eq!(response.body["result"]["status"], "ERROR");
    let errors = response.body["result"]["errors"].as_array().unwrap();
    assert!(errors.contains(&json!("declaration requires a schemaVersion string")));
    assert_eq!(fx.sim.processor.process_count(), 0);
}

#[tokio::test]
async fn test_device_init_failure_keeps_device_code() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.devices.fail_connect(DeviceError::Request {
        code: 401,
        message: "unauthorized".to_string(),
    });

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 401);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "failed to initialize device");
    assert_eq!(fx.sim.processor.process_count(), 0);
}

#[tokio::test]
async fn test_declaration_is_masked_in_ledger() {
    let fx = start(DeploymentMode::Standalone);
    let body = json!({
        "class": "DO",
        "targetUsername": "admin",
        "targetPassphrase": "admin",
        "declaration": {
            "class": "Device",
            "schemaVersion": "1.0.0",
            "Common": {
                "admin": {"class": "User", "password": "n3wpass"}
            }
        }
    });

    let response = fx.api.handle(post(&body)).await;

    assert_eq!(response.status, 200);
    assert!(response.body["declaration"].get("targetPassphrase").is_none());
    assert!(response.body["declaration"]["declaration"]["Common"]["admin"].get("password").is_none());
    assert_eq!(fx.sim.device.passwords_set(), vec![("admin".to_string(), "n3wpass".to_string())]);
    // processor still saw the real password
    assert_eq!(
        fx.sim.processor.declarations()[0]["Common"]["admin"]["password"],
        json!("n3wpass")
    );
}

#[tokio::test]
async fn test_account_setup_failure_stops_before_configuration() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.device.set_root_check(RootPasswordCheck::Fail);
    let body = json!({
        "class": "DO",
        "targetUsername": "admin",
        "targetPassphrase": "admin",
        "declaration": {
            "class": "Device",
            "schemaVersion": "1.0.0",
            "Common": {
                "admin": {"class": "User", "password": "n3wpass"},
                "root": {"class": "User", "oldPassword": "default", "newPassword": "r00tpass"}
            }
        }
    });

    let response = fx.api.handle(post(&body)).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "failed to set up initial account");
    assert_eq!(response.body["result"]["errors"].as_array().unwrap().len(), 1);
    assert_eq!(fx.sim.processor.process_count(), 0);
    assert!(fx.sim.processor.rollback_targets().is_empty());
    assert_eq!(fx.sim.device.save_count(), 0);
}

#[tokio::test]
async fn test_account_setup_connect_failure_is_500() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.devices.fail_connect(DeviceError::Request {
        code: 401,
        message: "unauthorized".to_string(),
    });
    let body = json!({
        "class": "DO",
        "targetUsername": "admin",
        "targetPassphrase": "admin",
        "declaration": {
            "class": "Device",
            "schemaVersion": "1.0.0",
            "Common": {"admin": {"class": "User", "password": "n3wpass"}}
        }
    });

    let response = fx.api.handle(post(&body)).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["message"], "failed to set up initial account");
    assert_eq!(fx.sim.processor.process_count(), 0);
}

#[tokio::test]
async fn test_snapshot_failure_is_terminal_without_processing() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.config_manager.fail_reads(ProcessError::new("config read timed out"));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "failed to read current configuration");
    assert_eq!(response.body["result"]["errors"], json!(["config read timed out"]));
    assert_eq!(fx.sim.processor.process_count(), 0);
    assert!(fx.sim.processor.rollback_targets().is_empty());
}

#[tokio::test]
async fn test_post_state_failure_keeps_device_code() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.device.fail_reboot_check(true);

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 503);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "failed to determine reboot state");
    // applied and saved, not rolled back
    assert_eq!(fx.sim.processor.process_count(), 1);
    assert_eq!(fx.sim.device.save_count(), 1);
    assert!(fx.sim.processor.rollback_targets().is_empty());
    assert_eq!(fx.sim.device.reboot_count(), 0);
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_rollback_ordering_and_422_remap() {
    let fx = start(DeploymentMode::Standalone);
    let mut events = fx.orchestrator.state().subscribe_events();
    fx.sim.processor.fail_next_process(ProcessError::with_code(400, "invalid vlan"));

    let response = fx.api.handle(post(&declaration())).await;
    let id = task_id(&response);

    assert_eq!(response.status, 422);
    assert_eq!(response.body["result"]["message"], "rolled back");
    assert_eq!(response.body["result"]["errors"], json!(["invalid vlan"]));
    assert_eq!(
        drain_events(&mut events, &id),
        vec![
            (Some(202), Some(TaskStatus::Running)),
            (Some(202), Some(TaskStatus::RollingBack)),
            (Some(422), Some(TaskStatus::Error)),
        ]
    );
    assert_eq!(fx.sim.processor.rollback_targets(), vec![json!({"hostname": "sim.localdomain"})]);
    assert_eq!(fx.sim.device.save_count(), 0);
}

#[tokio::test]
async fn test_rollback_failure_is_500_with_both_errors() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.processor.fail_next_process(ProcessError::with_code(400, "invalid vlan"));
    fx.sim.processor.fail_rollback(ProcessError::new("device unreachable"));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "rollback failed");
    assert_eq!(
        response.body["result"]["errors"],
        json!(["invalid vlan", "device unreachable"])
    );
}

#[tokio::test]
async fn test_save_failure_rolls_back() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.device.fail_save(true);

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["message"], "rolled back");
    assert_eq!(fx.sim.processor.rollback_targets().len(), 1);
}

// =============================================================================
// Reboot
// =============================================================================

#[tokio::test]
async fn test_reboot_in_standalone_completes_in_background() {
    let fx = start(DeploymentMode::Standalone);
    let mut events = fx.orchestrator.state().subscribe_events();
    fx.sim.processor.require_reboot(true);

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 202);
    assert_eq!(response.body["result"]["status"], "REBOOTING");
    wait_for_status(&mut events, TaskStatus::Ok).await;
    assert_eq!(fx.sim.device.reboot_count(), 1);

    let task = fx.orchestrator.state().get_task(&task_id(&response)).await.unwrap();
    assert!(!task.reboot_required);
}

#[tokio::test]
async fn test_embedded_reboot_finishes_on_restart() {
    let fx = start(DeploymentMode::Embedded);
    fx.sim.processor.require_reboot(true);

    let response = fx.api.handle(post(&declaration())).await;
    let id = task_id(&response);
    assert_eq!(response.body["result"]["status"], "REBOOTING");
    assert_eq!(fx.sim.device.reboot_count(), 1);

    // restart on whatever was persisted
    let saved = fx.storage.saved().expect("state was persisted");
    let storage = Arc::new(MemoryStorage::with_state(saved));
    let manager = StateManager::load(storage, StorageConfig::default()).await.unwrap();
    let sim = SimHarness::new(DEVICE_ID);
    let orchestrator = Orchestrator::start(config(DeploymentMode::Embedded), manager, sim.collaborators(None));

    match orchestrator.recover().await.unwrap() {
        Recovery::RebootCompleted { task_id } => assert_eq!(task_id, id),
        other => panic!("unexpected recovery: {:?}", other),
    }
    let task = orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.code, Some(200));
    assert_eq!(task.result.status, Some(TaskStatus::Ok));
    assert!(!task.reboot_required);
}

#[tokio::test]
async fn test_recovery_is_noop_outside_embedded() {
    let fx = start(DeploymentMode::Standalone);
    let id = fx.orchestrator.state().add_task().await.unwrap();
    fx.orchestrator
        .state()
        .update_result(&id, Some(202), Some(TaskStatus::Rebooting), None, ErrorUpdate::Keep)
        .await
        .unwrap();

    assert!(matches!(fx.orchestrator.recover().await.unwrap(), Recovery::Nothing));
    let task = fx.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Rebooting));
}

// =============================================================================
// License revocation
// =============================================================================

fn licensed_envelope() -> Value {
    json!({
        "class": "DO",
        "declaration": {
            "class": "Device",
            "schemaVersion": "1.0.0",
            "Common": {
                "myLicense": {
                    "class": "License",
                    "licenseType": "licensePool",
                    "bigIqHost": "10.0.0.5",
                    "bigIqUsername": "admin",
                    "bigIqPassword": "bigiq-secret",
                    "revokeFrom": "pool1",
                    "reachable": false
                }
            }
        }
    })
}

fn revoking_task(state: &mut DoState) -> String {
    let id = state.add_task();
    state.set_declaration(&id, &licensed_envelope()).unwrap();
    state
        .update_result(&id, Some(202), Some(TaskStatus::Revoking), Some("revoking license"), ErrorUpdate::Keep)
        .unwrap();
    id
}

#[tokio::test]
async fn test_revoke_event_parks_task_in_embedded_mode() {
    let fx = start(DeploymentMode::Embedded);
    let id = fx.orchestrator.state().add_task().await.unwrap();

    let applied = fx
        .orchestrator
        .handle_revoke(RevokeEvent {
            task_id: id.clone(),
            primary: "bigiq-secret".to_string(),
            secondary: "device-secret".to_string(),
        })
        .await
        .unwrap();

    assert!(applied);
    assert_eq!(fx.sim.vault.get(PRIMARY_SECRET_ID).as_deref(), Some("bigiq-secret"));
    assert_eq!(fx.sim.vault.get(SECONDARY_SECRET_ID).as_deref(), Some("device-secret"));
    let task = fx.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Revoking));
    assert_eq!(task.result.code, Some(202));
}

#[tokio::test]
async fn test_revoke_event_ignored_in_standalone_mode() {
    let fx = start(DeploymentMode::Standalone);
    let id = fx.orchestrator.state().add_task().await.unwrap();

    let applied = fx
        .orchestrator
        .handle_revoke(RevokeEvent {
            task_id: id.clone(),
            primary: "p".to_string(),
            secondary: "s".to_string(),
        })
        .await
        .unwrap();

    assert!(!applied);
    assert!(!fx.sim.vault.contains(PRIMARY_SECRET_ID));
    assert_eq!(fx.orchestrator.state().get_task(&id).await.unwrap().result.status, None);
}

#[tokio::test]
async fn test_processor_revoke_parks_task_until_restart() {
    let fx = start(DeploymentMode::Embedded);
    fx.sim.processor.revoke_on_process("bigiq-secret", "device-secret");

    let response = fx.api.handle(post(&licensed_envelope())).await;
    let id = task_id(&response);

    assert_eq!(response.status, 202);
    assert_eq!(response.body["result"]["status"], "REVOKING");
    assert!(fx.sim.vault.contains(PRIMARY_SECRET_ID));
    assert!(fx.sim.vault.contains(SECONDARY_SECRET_ID));
    assert_eq!(fx.sim.device.reboot_count(), 0);

    let task = fx.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Revoking));
    let saved = fx.storage.saved().unwrap();
    assert_eq!(saved["tasks"][id.as_str()]["result"]["status"], "REVOKING");
}

#[tokio::test]
async fn test_processor_revoke_resumes_after_restart() {
    let fx = start(DeploymentMode::Embedded);
    fx.sim.processor.revoke_on_process("bigiq-secret", "device-secret");
    let id = task_id(&fx.api.handle(post(&licensed_envelope())).await);

    // host comes back with the persisted ledger and the stashed secrets
    let saved = fx.storage.saved().unwrap();
    let restarted = start_with(DeploymentMode::Embedded, DoState::upgrade(saved), None);
    for secret in [PRIMARY_SECRET_ID, SECONDARY_SECRET_ID] {
        let value = fx.sim.vault.get(secret).unwrap();
        restarted.sim.vault.stash(secret, &value).await.unwrap();
    }

    let Recovery::Resuming { task_id: resumed, handle } = restarted.orchestrator.recover().await.unwrap() else {
        panic!("expected resume");
    };
    assert_eq!(resumed, id);
    handle.await.unwrap();

    let task = restarted.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Ok));
    let license = &restarted.sim.processor.declarations()[0]["Common"]["myLicense"];
    assert_eq!(license["bigIqPassword"], json!("bigiq-secret"));
    assert!(license.get("revokeFrom").is_none());
}

#[tokio::test]
async fn test_processor_revoke_outside_embedded_completes() {
    let fx = start(DeploymentMode::Standalone);
    fx.sim.processor.revoke_on_process("bigiq-secret", "device-secret");

    let response = fx.api.handle(post(&licensed_envelope())).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["result"]["status"], "OK");
    assert!(!fx.sim.vault.contains(PRIMARY_SECRET_ID));
}

#[tokio::test]
async fn test_resume_after_revoke_restores_credentials() {
    let mut state = DoState::default();
    let id = revoking_task(&mut state);
    let fx = start_with(DeploymentMode::Embedded, state, None);
    fx.sim.vault.stash(PRIMARY_SECRET_ID, "bigiq-secret").await.unwrap();
    fx.sim.vault.stash(SECONDARY_SECRET_ID, "device-secret").await.unwrap();

    let handle = match fx.orchestrator.recover().await.unwrap() {
        Recovery::Resuming { task_id, handle } => {
            assert_eq!(task_id, id);
            handle
        }
        other => panic!("unexpected recovery: {:?}", other),
    };
    handle.await.unwrap();

    let task = fx.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Ok));
    assert_eq!(task.result.code, Some(200));

    let license = &fx.sim.processor.declarations()[0]["Common"]["myLicense"];
    assert_eq!(license["bigIqPassword"], json!("bigiq-secret"));
    assert!(license.get("revokeFrom").is_none());
    assert!(license.get("bigIpPassword").is_none());

    let stored = &task.internal_declaration["declaration"]["Common"]["myLicense"];
    assert!(stored.get("revokeFrom").is_none());
    assert!(stored.get("bigIqPassword").is_none());
    assert!(!fx.sim.vault.contains(PRIMARY_SECRET_ID));
    assert!(!fx.sim.vault.contains(SECONDARY_SECRET_ID));
}

#[tokio::test]
async fn test_resume_without_stashed_secret_fails() {
    let mut state = DoState::default();
    let id = revoking_task(&mut state);
    let fx = start_with(DeploymentMode::Embedded, state, None);

    let Recovery::Resuming { handle, .. } = fx.orchestrator.recover().await.unwrap() else {
        panic!("expected resume");
    };
    handle.await.unwrap();

    let task = fx.orchestrator.state().get_task(&id).await.unwrap();
    assert_eq!(task.result.code, Some(500));
    assert_eq!(task.result.status, Some(TaskStatus::Error));
    assert_eq!(
        task.result.message.as_deref(),
        Some("failed to resume after license revocation")
    );
    assert_eq!(fx.sim.processor.process_count(), 0);
}

// =============================================================================
// Manager deployment
// =============================================================================

#[tokio::test]
async fn test_manager_delegates_and_polls() {
    let sender = Arc::new(ScriptedSender::with_statuses("r1", &["STARTED", "FINISHED"]));
    let fx = start_with(DeploymentMode::Manager, DoState::default(), Some(sender.clone()));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["result"]["status"], "OK");
    assert_eq!(sender.poll_count(), 2);
    assert_eq!(fx.sim.processor.process_count(), 0);

    // audit snapshot still taken from the device
    let config = fx.api.handle(request("GET", &format!("/onboard/config/{}", DEVICE_ID))).await;
    assert_eq!(config.status, 200);
    assert_eq!(config.body["originalConfig"], json!({"hostname": "sim.localdomain"}));
}

#[tokio::test]
async fn test_manager_remote_failure_is_422() {
    let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FAILED"]));
    sender.set_error_message("license pool empty");
    let fx = start_with(DeploymentMode::Manager, DoState::default(), Some(sender.clone()));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 422);
    assert_eq!(response.body["result"]["message"], "remote processing failed");
}

#[tokio::test]
async fn test_manager_submit_failure_is_500_with_audit_snapshot() {
    let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FINISHED"]));
    sender.fail_submit();
    let fx = start_with(DeploymentMode::Manager, DoState::default(), Some(sender.clone()));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["status"], "ERROR");
    assert_eq!(response.body["result"]["message"], "remote processing failed");
    assert_eq!(sender.poll_count(), 0);
    assert_eq!(fx.sim.processor.process_count(), 0);

    let config = fx.api.handle(request("GET", &format!("/onboard/config/{}", DEVICE_ID))).await;
    assert_eq!(config.status, 200);
    assert_eq!(config.body["originalConfig"], json!({"hostname": "sim.localdomain"}));
}

#[tokio::test]
async fn test_manager_poll_budget_exhaustion_is_500() {
    let sender = Arc::new(ScriptedSender::with_statuses("r1", &["STARTED"]));
    let fx = start_with(DeploymentMode::Manager, DoState::default(), Some(sender.clone()));

    let response = fx.api.handle(post(&declaration())).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["result"]["message"], "remote processing failed");
    // fixture budget is 5 attempts
    assert_eq!(sender.poll_count(), 5);
    assert_eq!(fx.sim.processor.process_count(), 0);

    let config = fx.api.handle(request("GET", &format!("/onboard/config/{}", DEVICE_ID))).await;
    assert_eq!(config.status, 200);
}

#[tokio::test]
async fn test_manager_processes_peer_requests_locally() {
    let sender = Arc::new(ScriptedSender::with_statuses("r1", &["FINISHED"]));
    let fx = start_with(DeploymentMode::Manager, DoState::default(), Some(sender.clone()));
    let mut req = post(&declaration());
    req.headers.insert(ORIGIN_HEADER.to_string(), "peer".to_string());
    req.headers.insert(CORRELATION_HEADER.to_string(), "corr-1".to_string());

    let response = fx.api.handle(req).await;

    assert_eq!(response.status, 200);
    assert_eq!(sender.poll_count(), 0);
    assert_eq!(fx.sim.processor.process_count(), 1);
    let task = fx.orchestrator.state().get_task(&task_id(&response)).await.unwrap();
    assert!(task.request_options.from_peer);
    assert_eq!(task.request_options.correlation_id.as_deref(), Some("corr-1"));
}

// =============================================================================
// Configuration snapshots, webhook, persistence
// =============================================================================

#[tokio::test]
async fn test_original_config_endpoints() {
    let fx = start(DeploymentMode::Standalone);
    fx.api.handle(post(&declaration())).await;

    let all = fx.api.handle(request("GET", "/onboard/config")).await;
    assert_eq!(all.status, 200);
    assert_eq!(all.body, json!([{"id": DEVICE_ID, "originalConfig": {"hostname": "sim.localdomain"}}]));

    assert_eq!(fx.api.handle(request("DELETE", "/onboard/config")).await.status, 400);
    assert_eq!(fx.api.handle(request("DELETE", "/onboard/config/unknown")).await.status, 404);

    let path = format!("/onboard/config/{}", DEVICE_ID);
    assert_eq!(fx.api.handle(request("DELETE", &path)).await.status, 200);
    assert_eq!(fx.api.handle(request("GET", &path)).await.status, 404);
}

#[tokio::test]
async fn test_webhook_receives_final_task() {
    let fx = start(DeploymentMode::Standalone);
    let body = json!({"class": "DO", "webhook": "http://hooks.example/done", "declaration": declaration()});

    let response = fx.api.handle(post(&body)).await;
    let id = task_id(&response);

    let deliveries = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let deliveries = fx.sim.notifier.deliveries();
            if !deliveries.is_empty() {
                return deliveries;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Webhook was never delivered");

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, "http://hooks.example/done");
    assert_eq!(deliveries[0].1.id, id);
    assert_eq!(deliveries[0].1.http_code(), 200);
}

#[tokio::test]
async fn test_ledger_survives_restart_on_disk() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("state.json");

    let sim = SimHarness::new(DEVICE_ID);
    let storage: Arc<dyn StatePersistence> = Arc::new(FileStorage::new(&path));
    let manager = StateManager::load(storage.clone(), StorageConfig::default()).await.unwrap();
    let orchestrator = Orchestrator::start(config(DeploymentMode::Standalone), manager, sim.collaborators(None));
    let api = ApiHandler::new(orchestrator, "/onboard");
    let id = task_id(&api.handle(post(&declaration())).await);

    let reloaded = StateManager::load(storage, StorageConfig::default()).await.unwrap();
    let task = reloaded.get_task(&id).await.unwrap();
    assert_eq!(task.result.status, Some(TaskStatus::Ok));
    assert_eq!(reloaded.get_original_config(DEVICE_ID).await.unwrap(), Some(json!({"hostname": "sim.localdomain"})));
}
