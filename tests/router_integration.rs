//! End-to-end router tests.
//!
//! Each test builds a relay from a config file in a temp directory and drives
//! it with the recording device, so every delivery is observable.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use swarm_relay::actuator::{AttemptResult, RecordingDevice, Transport};
use swarm_relay::ledger::LedgerStatus;
use swarm_relay::message::{MessageDraft, Priority, Recipient};
use swarm_relay::registry::Address;
use swarm_relay::router::{
    Alert, AlertKind, AlertSink, DeliveryMethod, Disposition, MessageRouter,
};
use swarm_relay::types::{AgentId, MessageId};
use swarm_relay::{Config, Error};
use tracing_test::traced_test;

const A: Address = Address { x: 100, y: 100 };
const B: Address = Address { x: 900, y: 100 };
const C: Address = Address { x: 100, y: 700 };

const REGISTRY: &str = r#"{ "agents": [
    { "id": "Agent-A", "primary_coordinates": [100, 100], "onboarding_coordinates": [100, 160], "description": "captain" },
    { "id": "Agent-B", "primary_coordinates": [900, 100], "onboarding_coordinates": [900, 160], "description": "integration" },
    { "id": "Agent-C", "primary_coordinates": [100, 700], "onboarding_coordinates": [100, 760], "description": "quality" }
] }"#;

#[derive(Debug, Default)]
struct CollectingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingSink {
    fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for CollectingSink {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

struct Relay {
    router: MessageRouter,
    device: Arc<RecordingDevice>,
    alerts: Arc<CollectingSink>,
    dir: tempfile::TempDir,
}

impl Relay {
    async fn inbox(&self, agent: &str) -> Vec<swarm_relay::message::Message> {
        self.router.inbox(&id(agent), None).await.unwrap()
    }

    async fn settle(&self) {
        self.router.drain(Duration::from_secs(10)).await.unwrap();
    }
}

fn id(raw: &str) -> AgentId {
    AgentId::from_string(raw.to_string()).unwrap()
}

const FAST_DELIVERY: &str = r#"{ "backoff": "1ms", "attempt_timeout": "1s" }"#;

fn write_config(dir: &Path, registry: &str, delivery: &str, extra: &str) -> Config {
    std::fs::write(dir.join("agents.json"), registry).unwrap();
    let config = format!(
        r#"{{
            "registry": {{ "path": "agents.json" }},
            "mailbox": {{ "root": "mailboxes", "attempt_journal": "attempts.jsonl" }},
            "delivery": {}
            {}
        }}"#,
        delivery, extra
    );
    let path = dir.join("relay.json");
    std::fs::write(&path, config).unwrap();
    Config::load(&path).unwrap()
}

async fn relay_with(registry: &str, delivery: &str, extra: &str) -> Relay {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), registry, delivery, extra);
    let device = Arc::new(RecordingDevice::new());
    let alerts = Arc::new(CollectingSink::default());
    let router = MessageRouter::from_config(&config, device.clone(), alerts.clone())
        .await
        .unwrap();
    Relay {
        router,
        device,
        alerts,
        dir,
    }
}

async fn relay() -> Relay {
    relay_with(REGISTRY, FAST_DELIVERY, "").await
}

fn direct(to: &str, body: &str) -> MessageDraft {
    MessageDraft::new(id("operator"), id(to), body)
}

#[tokio::test]
async fn test_identical_submissions_deliver_once() {
    let relay = relay().await;
    relay.router.start();

    let first = relay.router.submit(direct("Agent-A", "Deploy now")).await.unwrap();
    // Whitespace and case differences normalize to the same id.
    let second = relay
        .router
        .submit(direct("Agent-A", "  deploy   NOW "))
        .await
        .unwrap();
    relay.settle().await;

    assert_eq!(first.message_id, second.message_id);
    assert!(second.is_suppressed());
    assert_eq!(relay.device.attempts_at(A), 1);
    assert_eq!(relay.router.attempts(&first.message_id).len(), 1);
    assert_eq!(relay.inbox("Agent-A").await.len(), 1);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_second_router_on_shared_mailbox_does_not_redeliver() {
    let relay = relay().await;
    let config = Config::load(&relay.dir.path().join("relay.json")).unwrap();
    // Separate process: own ledger, same mailbox root, same desktop.
    let other = MessageRouter::from_config(
        &config,
        relay.device.clone(),
        Arc::new(CollectingSink::default()),
    )
    .await
    .unwrap();
    relay.router.start();
    other.start();

    let first = relay.router.submit(direct("Agent-A", "rebase main")).await.unwrap();
    let second = other.submit(direct("Agent-A", "rebase main")).await.unwrap();
    relay.settle().await;
    other.drain(Duration::from_secs(10)).await.unwrap();

    assert!(matches!(first.disposition, Disposition::Queued));
    assert_eq!(first.message_id, second.message_id);
    assert!(second.is_suppressed());
    assert_eq!(relay.device.attempts_at(A), 1);
    assert_eq!(relay.inbox("Agent-A").await.len(), 1);
    assert!(other.attempts(&second.message_id).is_empty());
    assert_eq!(
        other.ledger_status(&second.message_id).await,
        Some(LedgerStatus::MailboxOnly)
    );
    other.shutdown().await;
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_flood_limiter_caps_same_triple() {
    let relay = relay().await;
    relay.router.start();

    relay.router.submit(direct("Agent-B", "status one")).await.unwrap();
    let other_body = relay.router.submit(direct("Agent-B", "status two")).await.unwrap();
    relay.settle().await;

    assert!(matches!(
        other_body.disposition,
        Disposition::Suppressed(swarm_relay::ledger::SuppressionReason::Flooded { .. })
    ));
    assert_eq!(relay.device.attempts_at(B), 1);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_creates_independent_chains() {
    let relay = relay().await;
    relay.device.fail_always(B);
    relay.router.start();

    let outcomes = relay
        .router
        .broadcast(MessageDraft::broadcast(id("operator"), "sync at noon"))
        .await
        .unwrap();
    relay.settle().await;

    assert_eq!(outcomes.len(), 3);
    let ids: Vec<MessageId> = outcomes
        .iter()
        .map(|o| o.result.as_ref().unwrap().message_id.clone())
        .collect();
    // Recipient is part of the id.
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);

    assert_eq!(relay.device.delivered_to(A), 1);
    assert_eq!(relay.device.delivered_to(C), 1);
    assert_eq!(relay.device.delivered_to(B), 0);
    assert_eq!(relay.device.attempts_at(B), 3);

    for agent in ["Agent-A", "Agent-B", "Agent-C"] {
        assert_eq!(relay.inbox(agent).await.len(), 1, "mailbox of {}", agent);
    }
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let relay = relay().await;
    relay.router.start();

    let outcomes = relay
        .router
        .broadcast(MessageDraft::broadcast(id("Agent-A"), "hello team"))
        .await
        .unwrap();
    relay.settle().await;

    let agents: Vec<&str> = outcomes.iter().map(|o| o.agent.as_str()).collect();
    assert_eq!(agents, vec!["Agent-B", "Agent-C"]);
    assert_eq!(relay.device.attempts_at(A), 0);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_skips_inactive_agent() {
    let registry = r#"{ "agents": [
        { "id": "Agent-A", "primary_coordinates": [100, 100], "onboarding_coordinates": [100, 160] },
        { "id": "Agent-B", "primary_coordinates": [900, 100], "onboarding_coordinates": [900, 160], "active": false }
    ] }"#;
    let relay = relay_with(registry, FAST_DELIVERY, "").await;
    relay.router.start();

    let accepted = relay
        .router
        .submit(MessageDraft::new(id("operator"), Recipient::All, "ping"))
        .await
        .unwrap();
    relay.settle().await;

    let Disposition::FannedOut(outcomes) = accepted.disposition else {
        panic!("ALL must fan out");
    };
    assert_eq!(outcomes.len(), 1);
    let a_id = outcomes[0].result.as_ref().unwrap().message_id.clone();

    assert_eq!(relay.router.attempts(&a_id).len(), 1);
    assert_eq!(relay.inbox("Agent-A").await.len(), 1);
    assert_eq!(relay.router.attempts_for(&id("Agent-B")).len(), 0);
    assert_eq!(relay.inbox("Agent-B").await.len(), 0);
    assert_eq!(relay.device.attempts_at(B), 0);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_fall_back_to_mailbox_and_alert_once() {
    let relay = relay().await;
    relay.device.fail_always(A);
    relay.router.start();

    let accepted = relay.router.submit(direct("Agent-A", "report in")).await.unwrap();
    relay.settle().await;

    let chain = relay.router.attempts(&accepted.message_id);
    let summary: Vec<(DeliveryMethod, AttemptResult)> =
        chain.iter().map(|a| (a.method, a.result)).collect();
    assert_eq!(
        summary,
        vec![
            (DeliveryMethod::Actuator, AttemptResult::RetryableFailure),
            (DeliveryMethod::Actuator, AttemptResult::RetryableFailure),
            (DeliveryMethod::Actuator, AttemptResult::RetryableFailure),
            (DeliveryMethod::Mailbox, AttemptResult::Success),
        ]
    );
    let transports: Vec<Option<Transport>> = chain.iter().map(|a| a.transport).collect();
    assert_eq!(
        transports,
        vec![
            Some(Transport::ClipboardPaste),
            Some(Transport::DirectType),
            Some(Transport::ClipboardPaste),
            None,
        ]
    );

    let inbox = relay.inbox("Agent-A").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].id(), &accepted.message_id);

    let alerts = relay.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::ActuatorExhausted);
    assert_eq!(alerts[0].agent, id("Agent-A"));

    assert_eq!(
        relay.router.ledger_status(&accepted.message_id).await,
        Some(LedgerStatus::MailboxOnly)
    );
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failures_alert_is_rate_limited() {
    let relay = relay().await;
    relay.device.fail_always(A);
    relay.router.start();

    relay
        .router
        .submit(direct("Agent-A", "first").with_priority(Priority::Urgent))
        .await
        .unwrap();
    relay
        .router
        .submit(direct("Agent-A", "second").with_type(swarm_relay::message::MessageType::Status))
        .await
        .unwrap();
    relay.settle().await;

    assert_eq!(relay.device.attempts_at(A), 6);
    assert_eq!(relay.alerts.alerts().len(), 1);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let relay = relay().await;
    relay.device.fail_times(C, 1);
    relay.router.start();

    let accepted = relay.router.submit(direct("Agent-C", "retry me")).await.unwrap();
    relay.settle().await;

    let results: Vec<AttemptResult> = relay
        .router
        .attempts(&accepted.message_id)
        .iter()
        .map(|a| a.result)
        .collect();
    assert_eq!(
        results,
        vec![AttemptResult::RetryableFailure, AttemptResult::Success]
    );
    assert!(relay.alerts.alerts().is_empty());
    assert_eq!(
        relay.router.ledger_status(&accepted.message_id).await,
        Some(LedgerStatus::Delivered)
    );
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_fatal_fault_stops_retrying() {
    let relay = relay().await;
    relay.device.fail_fatally(B);
    relay.router.start();

    let accepted = relay.router.submit(direct("Agent-B", "unreachable")).await.unwrap();
    relay.settle().await;

    let chain = relay.router.attempts(&accepted.message_id);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].result, AttemptResult::FatalFailure);
    assert!(chain[1].is_fallback_marker());
    assert_eq!(relay.alerts.alerts()[0].kind, AlertKind::ActuatorFatal);
    assert_eq!(relay.inbox("Agent-B").await.len(), 1);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_queue_order_by_priority() {
    let relay = relay().await;
    // Queue everything before the worker starts.
    relay
        .router
        .submit(direct("Agent-A", "low").with_priority(Priority::Low))
        .await
        .unwrap();
    relay
        .router
        .submit(direct("Agent-B", "urgent").with_priority(Priority::Urgent))
        .await
        .unwrap();
    relay
        .router
        .submit(direct("Agent-C", "normal").with_priority(Priority::Normal))
        .await
        .unwrap();
    assert_eq!(relay.router.queue_len(), 3);

    relay.router.start();
    relay.settle().await;

    assert_eq!(relay.device.delivery_order(), vec![B, C, A]);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_resubmission_after_ttl_delivers_again() {
    let relay = relay_with(REGISTRY, FAST_DELIVERY, r#", "ledger": { "ttl": "200ms" }"#).await;
    relay.router.start();

    relay.router.submit(direct("Agent-A", "heartbeat")).await.unwrap();
    relay.settle().await;
    tokio::time::sleep(Duration::from_millis(450)).await;

    let again = relay.router.submit(direct("Agent-A", "heartbeat")).await.unwrap();
    relay.settle().await;

    assert!(!again.is_suppressed());
    assert_eq!(relay.device.delivered_to(A), 2);
    assert_eq!(relay.inbox("Agent-A").await.len(), 2);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_leaves_message_mailbox_only() {
    let relay = relay_with(REGISTRY, r#"{ "queue_capacity": 1 }"#, "").await;

    relay.router.submit(direct("Agent-A", "fits")).await.unwrap();
    let overflow = relay.router.submit(direct("Agent-B", "overflows")).await.unwrap();

    assert!(matches!(overflow.disposition, Disposition::MailboxOnly));
    assert_eq!(relay.inbox("Agent-B").await.len(), 1);
    let chain = relay.router.attempts(&overflow.message_id);
    assert_eq!(chain.len(), 1);
    assert!(chain[0].is_fallback_marker());
}

#[tokio::test]
async fn test_deactivated_agent_is_not_actuated() {
    let relay = relay().await;
    let accepted = relay.router.submit(direct("Agent-C", "queued")).await.unwrap();

    let deactivated = REGISTRY.replace(
        r#""description": "quality" }"#,
        r#""description": "quality", "active": false }"#,
    );
    std::fs::write(relay.dir.path().join("agents.json"), deactivated).unwrap();
    relay.router.reload_registry().unwrap();

    relay.router.start();
    relay.settle().await;

    assert_eq!(relay.device.attempts_at(C), 0);
    let chain = relay.router.attempts(&accepted.message_id);
    assert_eq!(chain.len(), 1);
    assert!(chain[0].is_fallback_marker());
    assert_eq!(relay.inbox("Agent-C").await.len(), 1);

    let err = relay.router.submit(direct("Agent-C", "later")).await.unwrap_err();
    assert!(matches!(err, Error::InactiveRecipient(_)));
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_cancel_is_per_recipient() {
    let relay = relay().await;
    let outcomes = relay
        .router
        .broadcast(MessageDraft::broadcast(id("operator"), "stand down"))
        .await
        .unwrap();
    let b = outcomes.iter().find(|o| o.agent.as_str() == "Agent-B").unwrap();
    assert!(relay
        .router
        .cancel(&b.result.as_ref().unwrap().message_id, &id("Agent-B")));

    relay.router.start();
    relay.settle().await;

    assert_eq!(relay.device.attempts_at(B), 0);
    assert_eq!(relay.device.delivered_to(A), 1);
    assert_eq!(relay.device.delivered_to(C), 1);
    relay.router.shutdown().await;
}

#[tokio::test]
async fn test_attempt_journal_written() {
    let relay = relay().await;
    relay.router.start();
    relay.router.submit(direct("Agent-A", "journal me")).await.unwrap();
    relay.settle().await;
    relay.router.shutdown().await;

    let raw = std::fs::read_to_string(relay.dir.path().join("attempts.jsonl")).unwrap();
    assert_eq!(raw.lines().count(), 1);
    assert!(raw.contains("\"ACTUATOR\""));
    assert!(raw.contains("\"SUCCESS\""));
}

#[tokio::test]
async fn test_mailbox_write_failure_is_rejected_and_alerted() {
    let relay = relay().await;
    // A directory where the log file should be makes the write fail.
    std::fs::create_dir_all(relay.dir.path().join("mailboxes").join("Agent-A.jsonl")).unwrap();

    let err = relay.router.submit(direct("Agent-A", "lost?")).await.unwrap_err();
    assert!(matches!(err, Error::MailboxWrite { .. }));
    assert_eq!(relay.router.queue_len(), 0);

    let alerts = relay.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::MailboxWriteFailed);
}

#[tokio::test]
async fn test_missing_registry_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.json");
    std::fs::write(&path, r#"{ "registry": { "path": "absent.json" } }"#).unwrap();
    let config = Config::load(&path).unwrap();

    let err = MessageRouter::from_config(
        &config,
        Arc::new(RecordingDevice::new()),
        Arc::new(CollectingSink::default()),
    )
    .await
    .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
#[traced_test]
async fn test_submission_outcomes_are_logged() {
    let relay = relay().await;
    relay.router.submit(direct("Agent-C", "noisy")).await.unwrap();
    relay.router.submit(direct("Agent-C", "noisy")).await.unwrap();

    assert!(logs_contain("submission_queued"));
    assert!(logs_contain("submission_suppressed"));
}
