//! Command Queue (spec §4.5): a bounded FIFO drained by a single worker
//! that respects a telemetry-slot lock so a command never overlaps a poll
//! of the same device (spec §5 "Ordering guarantees"). Grounded on the
//! teacher's worker-task style in `services/mqtt_service.rs` (one
//! `tokio::spawn`ed drain loop reading from an mpsc channel).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::adapters::{AdapterCommand, DeviceAdapter};
use crate::error::QueueError;

/// Action routed by a queued command (spec §4.5 "Each command has `action`").
pub enum CommandAction {
    Write { id: String, value: i64 },
    WriteMany { updates: Vec<(String, i64)> },
    /// Routed variant invoked by the smart scheduler through a
    /// config-mapping layer rather than a raw register write.
    InverterConfig { sensor_id: String, value: serde_json::Value },
}

/// Invoked with the outcome of a drained command, success or failure, so a
/// caller that queued the command on behalf of an inbound bus message can
/// publish the matching `{base}/{inverter_id}/ack` (spec §6 topic table).
pub type CommandCallback = Box<dyn FnOnce(Result<(), QueueError>) + Send>;
pub type ConfigHandler = Arc<dyn Fn(&str, &str, &serde_json::Value) -> Result<(), QueueError> + Send + Sync>;

pub struct InverterCommand {
    pub inverter_id: String,
    pub action: CommandAction,
    pub callback: Option<CommandCallback>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl InverterCommand {
    pub fn new(inverter_id: impl Into<String>, action: CommandAction) -> Self {
        Self { inverter_id: inverter_id.into(), action, callback: None, retry_count: 0, max_retries: 3 }
    }

    /// Overrides the default retry budget with `config.queue.max_retries`
    /// (spec §4.5 "requeues up to `max_retries` times on timeout").
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

enum QueueItem {
    Command(InverterCommand),
    Clear,
    Poison,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStatistics {
    pub queue_size: usize,
    pub processed: u64,
    pub failed: u64,
    /// Unix millis of the last completed command, 0 if none yet.
    pub last_command_time: u64,
}

/// Per-inverter record of when it was last polled, used to enforce the
/// telemetry-slot lock (spec §4.5, §5).
#[derive(Default)]
struct SlotTracker {
    last_poll: HashMap<String, Instant>,
}

/// Shared handle the orchestrator uses to notify the queue worker that a
/// poll just completed for a device, opening (or closing) its command
/// slot.
#[derive(Clone)]
pub struct TelemetrySlots {
    tracker: Arc<Mutex<SlotTracker>>,
    poll_interval: Duration,
}

impl TelemetrySlots {
    pub fn new(poll_interval: Duration) -> Self {
        Self { tracker: Arc::new(Mutex::new(SlotTracker::default())), poll_interval }
    }

    pub async fn notify_telemetry_polling(&self, device_id: &str) {
        let mut guard = self.tracker.lock().await;
        guard.last_poll.insert(device_id.to_string(), Instant::now());
    }

    /// Sleeps until at least `0.8 * poll_interval` has elapsed since the
    /// device's last poll, guaranteeing at-most-one-in-flight (spec §4.5).
    async fn wait_for_slot(&self, device_id: &str) {
        let threshold = self.poll_interval.mul_f64(0.8);
        loop {
            let elapsed = {
                let guard = self.tracker.lock().await;
                guard.last_poll.get(device_id).map(|t| t.elapsed())
            };
            match elapsed {
                Some(e) if e < threshold => tokio::time::sleep(threshold - e).await,
                _ => return,
            }
        }
    }
}

/// Registry of adapters the queue worker can invoke commands against,
/// keyed by inverter_id.
pub type AdapterHandle = Arc<Mutex<dyn DeviceAdapter>>;

pub struct CommandQueue {
    sender: mpsc::Sender<QueueItem>,
    receiver: Option<mpsc::Receiver<QueueItem>>,
    stats: Arc<Mutex<QueueStatistics>>,
    last_command_time: Arc<AtomicU64>,
    queue_len: Arc<AtomicUsize>,
    enqueue_wait: Duration,
    worker_handle: Option<tokio::task::JoinHandle<()>>,
    stop_notify: Arc<Notify>,
}

impl CommandQueue {
    pub fn new(capacity: usize, enqueue_wait: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Some(receiver),
            stats: Arc::new(Mutex::new(QueueStatistics::default())),
            last_command_time: Arc::new(AtomicU64::new(0)),
            queue_len: Arc::new(AtomicUsize::new(0)),
            enqueue_wait,
            worker_handle: None,
            stop_notify: Arc::new(Notify::new()),
        }
    }

    /// Starts the single drain worker (spec §4.5 "A single worker drains
    /// it"). `adapters` maps `inverter_id` to the adapter to invoke.
    pub fn start(
        &mut self,
        adapters: HashMap<String, AdapterHandle>,
        slots: TelemetrySlots,
        command_timeout: Duration,
        config_handler: ConfigHandler,
    ) {
        let mut receiver = self.receiver.take().expect("queue already started");
        let stats = self.stats.clone();
        let last_command_time = self.last_command_time.clone();
        let queue_len = self.queue_len.clone();
        let sender = self.sender.clone();

        self.worker_handle = Some(tokio::spawn(async move {
            loop {
                let item = match receiver.recv().await {
                    Some(item) => item,
                    None => break,
                };
                queue_len.fetch_sub(1, Ordering::Relaxed);
                let mut command = match item {
                    QueueItem::Poison => break,
                    QueueItem::Clear => {
                        let mut drained = 0usize;
                        while receiver.try_recv().is_ok() {
                            drained += 1;
                        }
                        queue_len.fetch_sub(drained.min(queue_len.load(Ordering::Relaxed)), Ordering::Relaxed);
                        continue;
                    }
                    QueueItem::Command(c) => c,
                };

                slots.wait_for_slot(&command.inverter_id).await;

                let outcome = run_command(&adapters, &command, command_timeout, &config_handler).await;

                // A timed-out command gets another try rather than going
                // straight to the callback, up to the command's own retry
                // budget (spec §4.5 "requeues up to `max_retries` times").
                if matches!(outcome, Err(QueueError::Timeout(_))) && command.retry_count < command.max_retries {
                    command.retry_count += 1;
                    queue_len.fetch_add(1, Ordering::Relaxed);
                    if sender.send(QueueItem::Command(command)).await.is_err() {
                        // channel closed mid-shutdown; nothing left to requeue onto.
                    }
                    continue;
                }

                {
                    let mut guard = stats.lock().await;
                    match &outcome {
                        Ok(()) => guard.processed += 1,
                        Err(_) => guard.failed += 1,
                    }
                }
                last_command_time.store(now_millis(), Ordering::Relaxed);

                if let Some(cb) = command.callback {
                    cb(outcome);
                }
            }
        }));
    }

    /// Enqueues a command, waiting up to `enqueue_wait` for room (spec §5
    /// "Backpressure"). Returns `QueueError::Full` if the wait times out.
    pub async fn enqueue(&self, command: InverterCommand) -> Result<(), QueueError> {
        match tokio::time::timeout(self.enqueue_wait, self.sender.send(QueueItem::Command(command))).await {
            Ok(Ok(())) => {
                self.queue_len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(QueueError::Full("queue".into())),
        }
    }

    /// Drops all commands currently queued ahead of this marker (spec §4.5
    /// "the queue exposes ... clear").
    pub async fn clear(&self) {
        let _ = self.sender.send(QueueItem::Clear).await;
    }

    /// Enqueues a poison value; the worker exits after the current command
    /// (spec §4.5 "On stop, a poison value is enqueued").
    pub async fn stop(&mut self) {
        let _ = self.sender.send(QueueItem::Poison).await;
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
        self.stop_notify.notify_waiters();
    }

    pub async fn statistics(&self) -> QueueStatistics {
        let guard = self.stats.lock().await;
        QueueStatistics {
            queue_size: self.queue_len.load(Ordering::Relaxed),
            processed: guard.processed,
            failed: guard.failed,
            last_command_time: self.last_command_time.load(Ordering::Relaxed),
        }
    }

    /// Cheap `Clone`-able enqueue handle, for callers (the bus command
    /// router) that only need to submit commands and don't own the queue
    /// itself — the orchestrator keeps the only `CommandQueue`.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle { sender: self.sender.clone(), queue_len: self.queue_len.clone(), enqueue_wait: self.enqueue_wait }
    }
}

#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueItem>,
    queue_len: Arc<AtomicUsize>,
    enqueue_wait: Duration,
}

impl QueueHandle {
    pub async fn enqueue(&self, command: InverterCommand) -> Result<(), QueueError> {
        match tokio::time::timeout(self.enqueue_wait, self.sender.send(QueueItem::Command(command))).await {
            Ok(Ok(())) => {
                self.queue_len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(QueueError::Full("queue".into())),
        }
    }
}

async fn run_command(
    adapters: &HashMap<String, AdapterHandle>,
    command: &InverterCommand,
    timeout: Duration,
    config_handler: &ConfigHandler,
) -> Result<(), QueueError> {
    match &command.action {
        CommandAction::Write { id, value } => {
            let adapter = adapters.get(&command.inverter_id).ok_or_else(|| QueueError::UnknownInverter(command.inverter_id.clone()))?;
            invoke_with_timeout(adapter, AdapterCommand::Write { id: id.clone(), value: *value }, timeout).await
        }
        CommandAction::WriteMany { updates } => {
            let adapter = adapters.get(&command.inverter_id).ok_or_else(|| QueueError::UnknownInverter(command.inverter_id.clone()))?;
            invoke_with_timeout(adapter, AdapterCommand::WriteMany { updates: updates.clone() }, timeout).await
        }
        CommandAction::InverterConfig { sensor_id, value } => config_handler(&command.inverter_id, sensor_id, value),
    }
}

async fn invoke_with_timeout(adapter: &AdapterHandle, command: AdapterCommand, timeout: Duration) -> Result<(), QueueError> {
    let mut guard = adapter.lock().await;
    match tokio::time::timeout(timeout, guard.handle_command(command)).await {
        Ok(Ok(outcome)) if outcome.ok => Ok(()),
        Ok(Ok(outcome)) => Err(QueueError::CommandFailed(outcome.detail)),
        Ok(Err(e)) => Err(QueueError::CommandFailed(e.to_string())),
        Err(_) => Err(QueueError::Timeout(timeout)),
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::CommandOutcome;
    use crate::error::AdapterError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Sleeps past the command timeout on its first `fail_times` calls,
    /// then succeeds immediately.
    struct FlakyAdapter {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DeviceAdapter for FlakyAdapter {
        async fn connect(&mut self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn close(&mut self) {}
        async fn check_connectivity(&mut self) -> bool {
            true
        }
        async fn read_serial_number(&mut self) -> Result<String, AdapterError> {
            Ok("FLAKY".into())
        }
        async fn handle_command(&mut self, _command: AdapterCommand) -> Result<CommandOutcome, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.fail_times {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(CommandOutcome { ok: true, detail: "ok".into() })
        }
    }

    fn null_config_handler() -> ConfigHandler {
        Arc::new(|_inverter_id, _sensor_id, _value| Ok(()))
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_command_is_requeued_and_eventually_succeeds() {
        let adapter: AdapterHandle = Arc::new(Mutex::new(FlakyAdapter { fail_times: 1, calls: AtomicU32::new(0) }));
        let mut adapters = HashMap::new();
        adapters.insert("inv1".to_string(), adapter);

        let mut queue = CommandQueue::new(4, Duration::from_millis(50));
        queue.start(adapters, TelemetrySlots::new(Duration::from_millis(10)), Duration::from_millis(10), null_config_handler());

        let command = InverterCommand::new("inv1", CommandAction::Write { id: "x".into(), value: 1 }).with_max_retries(2);
        queue.enqueue(command).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = queue.statistics().await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn command_failing_past_max_retries_is_reported_as_timeout() {
        let adapter: AdapterHandle = Arc::new(Mutex::new(FlakyAdapter { fail_times: 100, calls: AtomicU32::new(0) }));
        let mut adapters = HashMap::new();
        adapters.insert("inv1".to_string(), adapter);

        let mut queue = CommandQueue::new(4, Duration::from_millis(50));
        queue.start(adapters, TelemetrySlots::new(Duration::from_millis(10)), Duration::from_millis(10), null_config_handler());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut command = InverterCommand::new("inv1", CommandAction::Write { id: "x".into(), value: 1 }).with_max_retries(1);
        let tx = std::sync::Mutex::new(Some(tx));
        command.callback = Some(Box::new(move |outcome| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
        }));
        queue.enqueue(command).await.unwrap();

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(QueueError::Timeout(_))));
        let stats = queue.statistics().await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn slot_lock_waits_for_poll_gap() {
        let slots = TelemetrySlots::new(Duration::from_millis(50));
        slots.notify_telemetry_polling("inv1").await;
        let start = Instant::now();
        slots.wait_for_slot("inv1").await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn unknown_device_returns_immediately() {
        let slots = TelemetrySlots::new(Duration::from_millis(50));
        let start = Instant::now();
        slots.wait_for_slot("never-polled").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn enqueue_rejected_when_full_and_worker_not_draining() {
        let queue = CommandQueue::new(1, Duration::from_millis(20));
        queue.enqueue(InverterCommand::new("inv1", CommandAction::Write { id: "x".into(), value: 1 })).await.unwrap();
        let result = queue.enqueue(InverterCommand::new("inv1", CommandAction::Write { id: "y".into(), value: 2 })).await;
        assert!(matches!(result, Err(QueueError::Full(_))));
    }
}
