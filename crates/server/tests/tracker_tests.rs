//! Progress tracking tests: duplicate delivery, illegal edges, automatic
//! rollback, escalation of failed restores and the apply timeout sweep.

mod common;

use axum::http::{Method, StatusCode};
use common::{TestServer, sample_manifest};
use otter_core::{ProgressMessage, UpdateId, UpdateState};
use otter_server::{Bus, RequestContext};
use otter_server::background::spawn_progress_listener;
use serde_json::{Value, json};
use std::time::Duration;

/// A staged manifest rolled out to one gateway; returns (token, update_id).
async fn dispatched(server: &TestServer, gateway: &str) -> (String, String) {
    let id = server.staged_manifest("1.5.0").await;
    let report = server.rollout(&id, &[gateway], 100).await;
    let update_id = report["gateways"][0]["update_id"]
        .as_str()
        .unwrap()
        .to_string();
    (server.gateway_token(gateway).await, update_id)
}

async fn history(server: &TestServer, gateway: &str) -> Vec<Value> {
    let (status, body) = server
        .admin(Method::GET, &format!("/v1/gateways/{gateway}/updates"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    body.as_array().unwrap().clone()
}

async fn report_failure(
    server: &TestServer,
    gateway: &str,
    token: &str,
    update_id: &str,
    kind: &str,
) -> (StatusCode, Value) {
    server
        .request(
            Method::POST,
            "/updates/failure",
            Some(json!({
                "gateway_id": gateway,
                "version": "1.5.0",
                "update_id": update_id,
                "error": format!("{kind} went wrong"),
                "error_kind": kind,
            })),
            Some(token),
        )
        .await
}

#[tokio::test]
async fn test_duplicate_progress_is_acknowledged_once() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;

    let (status, body) = server
        .progress("gw-a", &token, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "applied", "state": "downloading"}));

    let (status, body) = server
        .progress("gw-a", &token, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "duplicate"}));

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "downloading");
    assert_eq!(rows[0]["logs"], json!(["downloading step"]));
}

#[tokio::test]
async fn test_late_redelivery_of_an_earlier_event_is_ignored() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;

    for pct in [10, 20] {
        let (status, body) = server
            .progress("gw-a", &token, &update_id, "downloading", pct)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "applied");
    }

    // The first event arrives again after the second one.
    let (status, body) = server
        .progress("gw-a", &token, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "duplicate"}));

    let (status, _) = server
        .progress("gw-a", &token, &update_id, "verifying", 25)
        .await;
    assert_eq!(status, StatusCode::OK);
    // An event from an earlier state is a duplicate, not an illegal edge.
    let (status, body) = server
        .progress("gw-a", &token, &update_id, "downloading", 20)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "duplicate"}));

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "verifying");
    assert_eq!(rows[0]["progress_percentage"], 25);
    assert_eq!(
        rows[0]["logs"],
        json!(["downloading step", "downloading step", "verifying step"])
    );
}

#[tokio::test]
async fn test_progress_within_a_state_refreshes_percentage() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;

    server
        .progress("gw-a", &token, &update_id, "downloading", 10)
        .await;
    let (status, _) = server
        .progress("gw-a", &token, &update_id, "downloading", 20)
        .await;
    assert_eq!(status, StatusCode::OK);

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["progress_percentage"], 20);
}

#[tokio::test]
async fn test_illegal_edge_leaves_state_unchanged() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;

    let (status, body) = server
        .progress("gw-a", &token, &update_id, "applying", 60)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "state_transition");

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "pending");
    assert_eq!(rows[0]["progress_percentage"], 0);
}

#[tokio::test]
async fn test_progress_for_foreign_update_forbidden() {
    let server = TestServer::new().await;
    let (_, update_id) = dispatched(&server, "gw-a").await;
    let other = server.gateway_token("gw-b").await;

    let (status, _) = server
        .progress("gw-b", &other, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Reporting in another gateway's name is refused before the tracker.
    let (status, _) = server
        .progress("gw-a", &other, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_failure_of_rollback_safe_release_requests_rollback() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;
    server.drive_to_applying("gw-a", &token, &update_id).await;

    let (status, body) = report_failure(&server, "gw-a", &token, &update_id, "health_check").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({"result": "applied", "state": "failed"}));

    let (status, command) = server.check("gw-a", &token, "1.5.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command["command"], "rollback");
    assert_eq!(command["update_id"], update_id.as_str());

    // The agent restores its backup and reports the outcome.
    let (status, body) = server
        .progress("gw-a", &token, &update_id, "rolled_back", 100)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["state"], "rolled_back");

    let (status, _) = server.check("gw-a", &token, "1.2.0").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(server.notifier.count(), 0);

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "rolled_back");
    assert_eq!(rows[0]["error_kind"], "health_check");
    assert_eq!(rows[0]["rollback_requested"], true);
}

#[tokio::test]
async fn test_failure_without_rollback_safety_is_final() {
    let server = TestServer::new().await;
    let mut manifest = sample_manifest("1.5.0");
    manifest["rollback_safe"] = json!(false);
    let (status, body) = server
        .admin(Method::POST, "/v1/manifests", Some(manifest))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["manifest_id"].as_str().unwrap().to_string();
    server
        .admin(Method::POST, &format!("/v1/manifests/{id}/publish"), None)
        .await;
    server
        .admin(
            Method::POST,
            &format!("/v1/manifests/{id}/promote"),
            Some(json!({"status": "testing"})),
        )
        .await;
    let report = server.rollout(&id, &["gw-a"], 100).await;
    let update_id = report["gateways"][0]["update_id"].as_str().unwrap().to_string();
    let token = server.gateway_token("gw-a").await;

    server.drive_to_applying("gw-a", &token, &update_id).await;
    report_failure(&server, "gw-a", &token, &update_id, "apply").await;

    let (status, _) = server.check("gw-a", &token, "1.5.0").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = server
        .progress("gw-a", &token, &update_id, "rolled_back", 100)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "state_transition");
}

#[tokio::test]
async fn test_restore_failure_escalates_without_rollback() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;
    server.drive_to_applying("gw-a", &token, &update_id).await;

    let (status, _) = report_failure(&server, "gw-a", &token, &update_id, "restore_failed").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(server.notifier.count(), 1);
    let (status, _) = server.check("gw-a", &token, "1.5.0").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, open) = server.admin(Method::GET, "/v1/admin/escalations", None).await;
    assert_eq!(status, StatusCode::OK);
    let open = open.as_array().unwrap().clone();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["gateway_id"], "gw-a");
    assert_eq!(open[0]["severity"], "critical");
    assert_eq!(open[0]["update_id"], update_id.as_str());

    // Re-delivery of the same failure does not escalate twice.
    let (status, body) =
        report_failure(&server, "gw-a", &token, &update_id, "restore_failed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "duplicate"}));
    assert_eq!(server.notifier.count(), 1);

    let escalation_id = open[0]["escalation_id"].as_str().unwrap();
    let ack_uri = format!("/v1/admin/escalations/{escalation_id}/acknowledge");
    let (status, _) = server
        .admin(Method::POST, &ack_uri, Some(json!({"note": "   "})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, acked) = server
        .admin(Method::POST, &ack_uri, Some(json!({"note": "reflashed on site"})))
        .await;
    assert_eq!(status, StatusCode::OK, "{acked}");
    assert_eq!(acked["note"], "reflashed on site");
    assert!(acked["acknowledged_at"].is_string());

    let (_, again) = server
        .admin(Method::POST, &ack_uri, Some(json!({"note": "second note"})))
        .await;
    assert_eq!(again["note"], "reflashed on site");

    let (_, open) = server.admin(Method::GET, "/v1/admin/escalations", None).await;
    assert!(open.as_array().unwrap().is_empty());
    let (_, all) = server
        .admin(Method::GET, "/v1/admin/escalations?open=false", None)
        .await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_report_for_wrong_version() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;
    server.drive_to_applying("gw-a", &token, &update_id).await;

    let (status, _) = server
        .request(
            Method::POST,
            "/updates/success",
            Some(json!({"gateway_id": "gw-a", "version": "9.9.9", "update_id": update_id})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Without an update id the row is resolved by version.
    let (status, body) = server
        .request(
            Method::POST,
            "/updates/success",
            Some(json!({"gateway_id": "gw-a", "version": "1.5.0"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["state"], "success");
}

#[tokio::test]
async fn test_applying_requires_a_recorded_backup() {
    let server = TestServer::with_config(|c| c.rollout.backup_retention_days = 0).await;
    let (token, update_id) = dispatched(&server, "gw-a").await;

    for (state, pct) in [("downloading", 10), ("verifying", 25), ("backing_up", 40)] {
        let (status, _) = server.progress("gw-a", &token, &update_id, state, pct).await;
        assert_eq!(status, StatusCode::OK);
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    let purged = server
        .state
        .fleet
        .orchestrator
        .purge_expired_backups(&RequestContext::system("test"))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let (status, body) = server
        .progress("gw-a", &token, &update_id, "applying", 60)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "precondition_failed");
}

#[tokio::test]
async fn test_restarted_agent_resumes_an_applying_update() {
    let server = TestServer::new().await;
    let (token, update_id) = dispatched(&server, "gw-a").await;
    server.drive_to_applying("gw-a", &token, &update_id).await;

    // The agent lost its pipeline; polling hands the same command back.
    let (status, command) = server.check("gw-a", &token, "1.2.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command["command"], "update");
    assert_eq!(command["update_id"], update_id.as_str());

    // The re-run repeats steps the row already recorded.
    let (status, body) = server
        .progress("gw-a", &token, &update_id, "downloading", 10)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "duplicate"}));
    let (status, body) = server
        .progress("gw-a", &token, &update_id, "applying", 70)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], "applied");

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "applying");
    assert_eq!(rows[0]["progress_percentage"], 70);
}

#[tokio::test]
async fn test_apply_timeout_fails_and_rolls_back() {
    let server = TestServer::with_config(|c| c.rollout.apply_timeout_secs = 1).await;
    let (token, update_id) = dispatched(&server, "gw-a").await;
    server.drive_to_applying("gw-a", &token, &update_id).await;

    let ctx = RequestContext::system("test");
    assert_eq!(server.state.fleet.sweep_apply_timeouts(&ctx).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(server.state.fleet.sweep_apply_timeouts(&ctx).await.unwrap(), 1);
    assert_eq!(server.state.fleet.sweep_apply_timeouts(&ctx).await.unwrap(), 0);

    let rows = history(&server, "gw-a").await;
    assert_eq!(rows[0]["state"], "failed");
    assert_eq!(rows[0]["error_kind"], "apply_timeout");

    let (status, command) = server.check("gw-a", &token, "1.5.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command["command"], "rollback");
}

#[tokio::test]
async fn test_progress_over_the_bus() {
    let server = TestServer::new().await;
    let listener = spawn_progress_listener(server.state.clone()).unwrap();
    let (_, update_id) = dispatched(&server, "gw-a").await;

    let message = ProgressMessage::new(
        UpdateId::parse(&update_id).unwrap(),
        UpdateState::Downloading,
        15,
    );
    server
        .bus
        .publish("gateways/gw-a/progress", serde_json::to_vec(&message).unwrap())
        .await
        .unwrap();

    let mut state = String::new();
    for _ in 0..100 {
        state = history(&server, "gw-a").await[0]["state"]
            .as_str()
            .unwrap()
            .to_string();
        if state == "downloading" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "downloading");
    listener.abort();
}
