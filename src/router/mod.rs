//! Message router - validation, dedup, persistence and delivery orchestration.
//!
//! ```text
//!  submit/broadcast ──► validate ──► ledger ──► mailbox (durable) ──► queue
//!                          │           │                                │
//!                       Rejected   Suppressed                 delivery worker (1)
//!                                                                       │
//!                                                              actuator engine
//!                                                                       │
//!                                               attempt log ◄── report ─┴─► ledger status
//! ```
//!
//! `submit` returns once the message is in the recipient's mailbox. Actuator
//! delivery happens later on the single delivery worker and never fails the
//! original submission; its outcome lives in the attempt log.

mod alerts;
mod attempts;
mod queue;

pub use alerts::{Alert, AlertDispatcher, AlertKind, AlertSink, TracingAlertSink};
pub use attempts::{AttemptLog, DeliveryAttempt, DeliveryMethod};
pub use queue::{DeliveryQueue, PushError, QueuedDelivery};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actuator::{ActuatorEngine, DeliveryState, InputDevice, Platform};
use crate::ledger::{
    IdempotencyKey, IdempotencyLedger, LedgerStatus, LedgerSweeper, SuppressionReason,
};
use crate::mailbox::{AppendOutcome, MailboxStore};
use crate::message::{Message, MessageDraft, Recipient};
use crate::registry::CoordinateRegistry;
use crate::types::{AgentId, Config, Error, MessageId, Result};

/// What happened to an accepted submission.
#[derive(Debug)]
pub enum Disposition {
    /// Persisted to the mailbox and queued for the actuator.
    Queued,
    /// Persisted to the mailbox; the queue was full, so no actuator delivery.
    MailboxOnly,
    /// Recognized as redundant; nothing was written or queued.
    Suppressed(SuppressionReason),
    /// An ALL submission, expanded into one obligation per active agent.
    FannedOut(Vec<RecipientOutcome>),
}

/// Positive answer to a submission.
#[derive(Debug)]
pub struct Accepted {
    pub message_id: MessageId,
    pub recipient: Recipient,
    pub disposition: Disposition,
}

impl Accepted {
    pub fn is_suppressed(&self) -> bool {
        matches!(self.disposition, Disposition::Suppressed(_))
    }
}

/// Per-agent result of a broadcast.
#[derive(Debug)]
pub struct RecipientOutcome {
    pub agent: AgentId,
    pub result: Result<Accepted>,
}

/// State shared between the router front and the delivery worker.
#[derive(Debug)]
struct RouterShared {
    registry: Arc<CoordinateRegistry>,
    mailbox: Arc<MailboxStore>,
    ledger: Arc<Mutex<IdempotencyLedger>>,
    engine: ActuatorEngine,
    queue: DeliveryQueue,
    attempts: AttemptLog,
    alerts: AlertDispatcher,
    /// Queued or in-flight actuator deliveries, flagged once cancelled.
    obligations: StdMutex<HashMap<(MessageId, AgentId), bool>>,
    operators: HashSet<String>,
    bucket_width: Duration,
    /// Queued plus in-flight deliveries.
    outstanding: AtomicUsize,
    idle: Notify,
}

/// The routing core.
#[derive(Debug)]
pub struct MessageRouter {
    shared: Arc<RouterShared>,
    stop: CancellationToken,
    worker: StdMutex<Option<JoinHandle<()>>>,
    sweeper: StdMutex<LedgerSweeper>,
    drain_timeout: Duration,
}

impl MessageRouter {
    /// Assemble a router from already-constructed parts.
    pub fn new(
        config: &Config,
        registry: Arc<CoordinateRegistry>,
        mailbox: Arc<MailboxStore>,
        engine: ActuatorEngine,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        let ledger = Arc::new(Mutex::new(IdempotencyLedger::new(&config.ledger)));
        let sweeper = LedgerSweeper::new(ledger.clone(), config.ledger.sweep_interval);

        let shared = RouterShared {
            registry,
            mailbox,
            ledger,
            engine,
            queue: DeliveryQueue::new(config.delivery.queue_capacity),
            attempts: AttemptLog::new(config.mailbox.attempt_journal.clone()),
            alerts: AlertDispatcher::new(alert_sink, &config.alerts),
            obligations: StdMutex::new(HashMap::new()),
            operators: config.router.operator_ids.iter().cloned().collect(),
            bucket_width: config.ledger.ttl,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        };

        Self {
            shared: Arc::new(shared),
            stop: CancellationToken::new(),
            worker: StdMutex::new(None),
            sweeper: StdMutex::new(sweeper),
            drain_timeout: config.delivery.drain_timeout,
        }
    }

    /// Load the registry, open the mailbox and wire the engine to `device`.
    pub async fn from_config(
        config: &Config,
        device: Arc<dyn InputDevice>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(CoordinateRegistry::load(
            &config.registry.path,
            config.registry.bounds,
        )?);
        let mailbox = Arc::new(MailboxStore::open(config.mailbox.root.clone()).await?);
        let engine = ActuatorEngine::new(device, Platform::detect(), &config.delivery);
        Ok(Self::new(config, registry, mailbox, engine, alert_sink))
    }

    /// Spawn the delivery worker and the ledger sweeper. Idempotent.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let token = self.stop.clone();
        *worker = Some(tokio::spawn(async move {
            run_worker(shared, token).await;
        }));
        let _sweeper_task = lock(&self.sweeper).start();
        tracing::info!("router_started");
    }

    /// Stop accepting deliveries, let the in-flight one finish, stop the worker.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.shared.queue.close();
        lock(&self.sweeper).stop();

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "delivery worker aborted"),
                Err(_) => tracing::warn!("delivery worker did not stop within drain timeout"),
            }
        }
        tracing::info!("router_stopped");
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit one message. `Err` is a rejection; `Ok` may still be suppressed.
    pub async fn submit(&self, draft: MessageDraft) -> Result<Accepted> {
        self.validate_sender(&draft.sender)?;
        let now = Utc::now();

        match draft.recipient.clone() {
            Recipient::All => {
                let root = draft.clone().seal(now, self.shared.bucket_width)?;
                let outcomes = self.fan_out(draft, now).await;
                Ok(Accepted {
                    message_id: root.id().clone(),
                    recipient: Recipient::All,
                    disposition: Disposition::FannedOut(outcomes),
                })
            }
            Recipient::Agent(agent) => self.submit_to(agent, draft, now).await,
        }
    }

    /// Fan `draft` out to every active agent except the sender.
    pub async fn broadcast(&self, draft: MessageDraft) -> Result<Vec<RecipientOutcome>> {
        self.validate_sender(&draft.sender)?;
        Ok(self.fan_out(draft, Utc::now()).await)
    }

    async fn fan_out(&self, draft: MessageDraft, now: DateTime<Utc>) -> Vec<RecipientOutcome> {
        let targets: Vec<AgentId> = self
            .shared
            .registry
            .list_active()
            .into_iter()
            .filter(|agent| *agent != draft.sender)
            .collect();

        let submissions = targets.into_iter().map(|agent| {
            let per_agent = draft.addressed_to(agent.clone());
            async move {
                let result = self.submit_to(agent.clone(), per_agent, now).await;
                RecipientOutcome { agent, result }
            }
        });
        let outcomes = futures::future::join_all(submissions).await;

        tracing::info!(
            sender = %draft.sender,
            recipients = outcomes.len(),
            accepted = outcomes.iter().filter(|o| o.result.is_ok()).count(),
            "broadcast_fanned_out"
        );
        outcomes
    }

    async fn submit_to(
        &self,
        agent: AgentId,
        draft: MessageDraft,
        now: DateTime<Utc>,
    ) -> Result<Accepted> {
        let shared = &self.shared;

        let snapshot = shared.registry.snapshot();
        let entry = snapshot
            .get(&agent)
            .ok_or_else(|| Error::unknown_recipient(agent.as_str()))?;
        if !entry.active {
            return Err(Error::inactive_recipient(agent.as_str()));
        }

        let message = draft.seal(now, shared.bucket_width)?;
        let key = IdempotencyKey::for_message(&message);
        let recipient = message.recipient().clone();

        if let Err(reason) = shared.ledger.lock().await.admit(&key, now) {
            tracing::info!(
                message_id = %message.id(),
                agent = %agent,
                ?reason,
                "submission_suppressed"
            );
            return Ok(Accepted {
                message_id: message.id().clone(),
                recipient,
                disposition: Disposition::Suppressed(reason),
            });
        }

        match shared.mailbox.append(&agent, &message).await {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::AlreadyPresent) => {
                // Another router instance on the same mailbox root owns this
                // delivery; its copy is already the delivery of record.
                let status = LedgerStatus::MailboxOnly;
                shared.ledger.lock().await.record(&key, status, Utc::now());
                let reason = SuppressionReason::Duplicate { status };
                tracing::info!(
                    message_id = %message.id(),
                    agent = %agent,
                    ?reason,
                    "submission_suppressed"
                );
                return Ok(Accepted {
                    message_id: message.id().clone(),
                    recipient,
                    disposition: Disposition::Suppressed(reason),
                });
            }
            Err(e) => {
                shared
                    .ledger
                    .lock()
                    .await
                    .record(&key, LedgerStatus::Failed, Utc::now());
                tracing::error!(message_id = %message.id(), agent = %agent, error = %e, "mailbox_persist_failed");
                shared.alerts.raise(Alert {
                    kind: AlertKind::MailboxWriteFailed,
                    agent: agent.clone(),
                    message_id: message.id().clone(),
                    detail: e.to_string(),
                    raised_at: Utc::now(),
                });
                return Err(e);
            }
        }

        let message_id = message.id().clone();
        let priority = message.priority();
        let obligation = (message_id.clone(), agent.clone());
        lock(&shared.obligations).insert(obligation.clone(), false);
        shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let pushed = shared.queue.push(QueuedDelivery {
            message: Arc::new(message),
            agent: agent.clone(),
        });

        let disposition = match pushed {
            Ok(()) => {
                tracing::info!(message_id = %message_id, agent = %agent, %priority, "submission_queued");
                Disposition::Queued
            }
            Err(reason) => {
                lock(&shared.obligations).remove(&obligation);
                shared.finish_one();
                tracing::warn!(message_id = %message_id, agent = %agent, ?reason, "delivery queue refused; mailbox only");
                shared
                    .attempts
                    .append(DeliveryAttempt::fallback_marker(
                        message_id.clone(),
                        agent.clone(),
                        1,
                        format!("fallback: delivery queue {:?}", reason).to_lowercase(),
                    ))
                    .await;
                shared
                    .ledger
                    .lock()
                    .await
                    .record(&key, LedgerStatus::MailboxOnly, Utc::now());
                Disposition::MailboxOnly
            }
        };

        Ok(Accepted {
            message_id,
            recipient,
            disposition,
        })
    }

    fn validate_sender(&self, sender: &AgentId) -> Result<()> {
        if self.shared.operators.contains(sender.as_str())
            || self.shared.registry.snapshot().contains(sender)
        {
            Ok(())
        } else {
            Err(Error::unknown_sender(sender.as_str()))
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Withdraw the obligation to deliver `message_id` to `agent`, queued or
    /// in flight. The mailbox copy stays. Returns `false` when no such
    /// delivery is outstanding.
    pub fn cancel(&self, message_id: &MessageId, agent: &AgentId) -> bool {
        let key = (message_id.clone(), agent.clone());
        match lock(&self.shared.obligations).get_mut(&key) {
            Some(cancelled) => {
                *cancelled = true;
                tracing::info!(message_id = %message_id, agent = %agent, "delivery_cancel_requested");
                true
            }
            None => {
                tracing::debug!(message_id = %message_id, agent = %agent, "cancel: no outstanding delivery");
                false
            }
        }
    }

    /// Actuator deliveries queued or in flight.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.obligations).len()
    }

    /// Re-read the registry. Deactivated agents stop receiving actuator
    /// attempts from the next attempt on.
    pub fn reload_registry(&self) -> Result<()> {
        self.shared.registry.reload()
    }

    /// Wait until nothing is queued or in flight, at most `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return Err(Error::timeout(format!(
                    "{} deliveries still outstanding after {}ms",
                    self.shared.outstanding.load(Ordering::SeqCst),
                    timeout.as_millis()
                )));
            }
        }
    }

    /// `drain` bounded by the configured drain timeout.
    pub async fn drain_default(&self) -> Result<()> {
        self.drain(self.drain_timeout).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn attempts(&self, message_id: &MessageId) -> Vec<DeliveryAttempt> {
        self.shared.attempts.for_message(message_id)
    }

    pub fn attempts_for(&self, agent: &AgentId) -> Vec<DeliveryAttempt> {
        self.shared.attempts.for_agent(agent)
    }

    pub fn all_attempts(&self) -> Vec<DeliveryAttempt> {
        self.shared.attempts.all()
    }

    pub async fn inbox(&self, agent: &AgentId, since: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
        self.shared.mailbox.list(agent, since).await
    }

    pub async fn ledger_status(&self, message_id: &MessageId) -> Option<LedgerStatus> {
        self.shared.ledger.lock().await.status(message_id, Utc::now())
    }

    pub fn registry(&self) -> &Arc<CoordinateRegistry> {
        &self.shared.registry
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.stop.cancel();
        self.shared.queue.close();
    }
}

// =============================================================================
// Delivery worker
// =============================================================================

async fn run_worker(shared: Arc<RouterShared>, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            next = shared.queue.pop() => next,
        };
        let Some(delivery) = next else {
            break;
        };
        shared.deliver(delivery).await;
        shared.finish_one();
    }
    tracing::info!("delivery_worker_stopped");
}

impl RouterShared {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn still_wanted(&self, message_id: &MessageId, agent: &AgentId) -> bool {
        let key = (message_id.clone(), agent.clone());
        let cancelled = lock(&self.obligations).get(&key).copied().unwrap_or(false);
        !cancelled && self.registry.is_active(agent)
    }

    async fn deliver(&self, delivery: QueuedDelivery) {
        let QueuedDelivery { message, agent } = delivery;
        let message_id = message.id().clone();
        self.deliver_obligation(&message, &agent).await;
        lock(&self.obligations).remove(&(message_id, agent));
    }

    async fn deliver_obligation(&self, message: &Message, agent: &AgentId) {
        let key = IdempotencyKey::for_message(message);
        let message_id = message.id().clone();
        let agent = agent.clone();

        let address = match self.registry.agent(&agent) {
            Ok(entry) if message.message_type().uses_onboarding_address() => entry.onboarding,
            Ok(entry) => entry.primary,
            Err(_) => {
                self.demote(&key, &agent, 1, "fallback: recipient no longer registered")
                    .await;
                return;
            }
        };

        let report = self
            .engine
            .deliver_checked(message, address, || self.still_wanted(&message_id, &agent))
            .await;

        for record in &report.attempts {
            self.attempts
                .append(DeliveryAttempt {
                    message_id: message_id.clone(),
                    agent: agent.clone(),
                    method: DeliveryMethod::Actuator,
                    attempt: record.attempt,
                    result: record.result,
                    transport: Some(record.transport),
                    detail: record.detail.clone(),
                    timestamp: record.at,
                })
                .await;
        }
        let next_attempt = report.attempts.len() as u32 + 1;

        match report.state {
            DeliveryState::Delivered => {
                tracing::info!(message_id = %message_id, agent = %agent, %address, "delivered");
                self.ledger
                    .lock()
                    .await
                    .record(&key, LedgerStatus::Delivered, Utc::now());
            }
            DeliveryState::Fallback => {
                self.demote(&key, &agent, next_attempt, "fallback: actuator attempts exhausted")
                    .await;
                self.alerts.raise(Alert {
                    kind: AlertKind::ActuatorExhausted,
                    agent: agent.clone(),
                    message_id: message_id.clone(),
                    detail: last_detail(&report.attempts),
                    raised_at: Utc::now(),
                });
            }
            DeliveryState::Fatal => {
                self.demote(&key, &agent, next_attempt, "fallback: fatal actuator fault")
                    .await;
                self.alerts.raise(Alert {
                    kind: AlertKind::ActuatorFatal,
                    agent: agent.clone(),
                    message_id: message_id.clone(),
                    detail: last_detail(&report.attempts),
                    raised_at: Utc::now(),
                });
            }
            DeliveryState::Cancelled => {
                self.demote(&key, &agent, next_attempt, "cancelled: mailbox copy retained")
                    .await;
            }
            other => {
                tracing::error!(message_id = %message_id, state = ?other, "delivery ended in non-terminal state");
            }
        }
    }

    /// The mailbox copy becomes the delivery of record.
    async fn demote(&self, key: &IdempotencyKey, agent: &AgentId, attempt: u32, detail: &str) {
        tracing::warn!(message_id = %key.digest, agent = %agent, detail, "delivery_demoted_to_mailbox");
        self.attempts
            .append(DeliveryAttempt::fallback_marker(
                key.digest.clone(),
                agent.clone(),
                attempt,
                detail,
            ))
            .await;
        self.ledger
            .lock()
            .await
            .record(key, LedgerStatus::MailboxOnly, Utc::now());
    }
}

fn last_detail(attempts: &[crate::actuator::AttemptRecord]) -> String {
    attempts
        .last()
        .and_then(|a| a.detail.clone())
        .unwrap_or_default()
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
