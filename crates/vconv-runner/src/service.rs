//! Runner service: registration, heartbeats, task acquisition, dispatch.
//!
//! Stage processors run on their own tasks and report back over an event
//! channel; this service is the only writer of the queues and the carry
//! store. Ticker loops (poll, heartbeat) are spawned alongside the main
//! select loop and stopped through the shared shutdown channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use vconv_client::{ControlPlane, MachineRegistration, RunnerIdentity};
use vconv_media::{BitrateTarget, Downloader};
use vconv_models::{Encoder, Stage, Task, TaskError, TaskStatus};

use crate::carry::CarryStore;
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::probe::probe_system;
use crate::queue::{QueueConfig, StageQueues};
use crate::state::{run_failed, StageContext, StageOutcome, StageProcessor};
use crate::workspace::Workspace;

/// Consecutive heartbeat failures logged before suppression kicks in.
const HEARTBEAT_LOGGED_FAILURES: u32 = 3;

/// What a stage processor reports back to the service.
#[derive(Debug)]
pub enum StageEvent {
    Finished {
        stage: Stage,
        task: Task,
        outcome: StageOutcome,
    },
    Errored {
        stage: Stage,
        task: Task,
        error: TaskError,
    },
}

/// Suppresses log spam from a continuously failing background loop.
#[derive(Debug, Default)]
struct FailureTracker {
    consecutive: u32,
}

impl FailureTracker {
    fn record_success(&mut self) {
        if self.consecutive > HEARTBEAT_LOGGED_FAILURES {
            info!("Heartbeat recovered after {} failures", self.consecutive);
        }
        self.consecutive = 0;
    }

    /// Returns whether this failure should be logged.
    fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive <= HEARTBEAT_LOGGED_FAILURES
    }
}

/// The long-lived runner.
pub struct RunnerService {
    config: RunnerConfig,
    identity: RunnerIdentity,
    client: ControlPlane,
    queue: Arc<StageQueues>,
    carry: Arc<CarryStore>,
    workspace: Workspace,
    hardware: Arc<AtomicBool>,
}

impl RunnerService {
    /// Resolve identity and construct the service. Fails fast when the
    /// encoder binaries or required configuration are missing.
    pub fn bootstrap(config: RunnerConfig) -> RunnerResult<Self> {
        which::which("ffmpeg")
            .map_err(|_| RunnerError::config("ffmpeg not found in PATH"))?;
        which::which("ffprobe")
            .map_err(|_| RunnerError::config("ffprobe not found in PATH"))?;

        let identity_path = RunnerIdentity::default_path().map_err(RunnerError::Client)?;
        let identity = match RunnerIdentity::load(&identity_path) {
            Some(identity) => identity,
            None => {
                let token = config.bootstrap_token.clone().ok_or_else(|| {
                    RunnerError::config("no persisted identity and no bootstrap token set")
                })?;
                RunnerIdentity::generate(config.machine_name.clone(), token)
            }
        };

        let client = ControlPlane::new(&config.base_url, &identity.token)?;
        let queue = Arc::new(StageQueues::new(QueueConfig {
            download_slots: config.download_slots,
            convert_slots: config.convert_slots,
            upload_slots: config.upload_slots,
        }));

        Ok(Self {
            workspace: Workspace::new(config.scratch_root.clone()),
            queue,
            carry: Arc::new(CarryStore::new()),
            hardware: Arc::new(AtomicBool::new(
                config.encoder_hint == Encoder::Hardware,
            )),
            identity,
            client,
            config,
        })
    }

    /// Run until the shutdown channel fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunnerResult<()> {
        self.workspace.ensure_root().await?;

        // Object-store credentials are fetched per upload; this early call
        // only surfaces a misconfigured store before work arrives.
        if let Err(e) = self.client.object_store_credentials().await {
            warn!("Object store credentials unavailable at startup: {}", e);
        }

        self.register().await?;

        let downloader = Downloader::new(self.config.download.clone())?;
        let (events_tx, mut events_rx) = mpsc::channel::<StageEvent>(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = StageContext {
            client: self.client.clone(),
            downloader: Arc::new(downloader),
            workspace: self.workspace.clone(),
            hardware: Arc::clone(&self.hardware),
            bitrate: BitrateTarget::default(),
            cancel: cancel_rx,
        };

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            self.config.heartbeat_interval,
            self.config.encoder_hint,
            Arc::clone(&self.hardware),
            shutdown.clone(),
        ));
        let poll = tokio::spawn(poll_loop(
            self.client.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.carry),
            self.config.poll_interval,
            shutdown.clone(),
        ));

        let mut dispatch_ticker = tokio::time::interval(self.config.dispatch_interval);
        dispatch_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Runner {} entering dispatch loop", self.identity.id);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                Some(event) = events_rx.recv() => {
                    self.handle_event(event, &ctx).await;
                }
                _ = dispatch_ticker.tick() => {
                    self.dispatch(&ctx, &events_tx);
                }
            }
        }

        // Abandon in-flight work: cancel everything, drain events briefly
        // so processors can observe the cancellation, then exit. The
        // control plane times abandoned tasks out.
        let _ = cancel_tx.send(true);
        let drain = tokio::time::timeout(self.config.shutdown_timeout, async {
            while in_flight_total(&self.queue) > 0 {
                match tokio::time::timeout(Duration::from_millis(250), events_rx.recv()).await {
                    Ok(Some(event)) => self.handle_event(event, &ctx).await,
                    Ok(None) => break,
                    Err(_) => {}
                }
            }
        })
        .await;
        if drain.is_err() {
            warn!("Shutdown drain timed out with work still in flight");
        }

        heartbeat.abort();
        poll.abort();
        info!("Runner stopped");
        Ok(())
    }

    /// Register with the control plane; fatal on failure.
    async fn register(&mut self) -> RunnerResult<()> {
        let (device_info, encoder) = probe_system(self.config.encoder_hint).await;
        self.hardware
            .store(encoder == Encoder::Hardware, Ordering::Relaxed);

        let machine = MachineRegistration {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            device_info,
            encoder,
        };

        let record = self.client.register(&machine).await?;
        info!(runner_id = %record.id, encoder = %encoder, "Registered with control plane");

        // The control plane is authoritative for id and token; persist
        // whatever it hands back.
        let mut changed = record.id != self.identity.id;
        self.identity.id = record.id;
        if let Some(token) = record.token {
            if token != self.identity.token {
                self.client = self.client.with_token(&token);
                self.identity.token = token;
                changed = true;
            }
        }
        if let Some(name) = record.name {
            changed |= name != self.identity.name;
            self.identity.name = name;
        }

        let path = RunnerIdentity::default_path().map_err(RunnerError::Client)?;
        if changed || !path.exists() {
            self.identity.save(&path).map_err(RunnerError::Client)?;
        }
        Ok(())
    }

    /// Try every stage once; spawn a processor for each popped task.
    fn dispatch(&self, ctx: &StageContext, events: &mpsc::Sender<StageEvent>) {
        for stage in [Stage::Download, Stage::Convert, Stage::Upload] {
            let task = match stage {
                Stage::Download => self.queue.next_download(),
                Stage::Convert => self.queue.next_convert(),
                Stage::Upload => self.queue.next_upload(),
            };

            if let Some(mut task) = task {
                let carry = self.carry.get(&task.id).unwrap_or_default();
                let ctx = ctx.clone();
                let events = events.clone();

                tokio::spawn(async move {
                    let processor = StageProcessor::new(stage, ctx);
                    let sent = match processor.run(&mut task, &carry).await {
                        Ok(outcome) => {
                            events
                                .send(StageEvent::Finished {
                                    stage,
                                    task,
                                    outcome,
                                })
                                .await
                        }
                        Err(error) => {
                            events
                                .send(StageEvent::Errored { stage, task, error })
                                .await
                        }
                    };
                    if sent.is_err() {
                        debug!("Event channel closed before stage result was delivered");
                    }
                });
            }
        }
    }

    /// Apply one stage result: the only place queue and carry mutate in
    /// response to processor work.
    async fn handle_event(&self, event: StageEvent, ctx: &StageContext) {
        match event {
            StageEvent::Finished {
                stage: Stage::Download,
                task,
                outcome: StageOutcome::Downloaded { path },
            } => {
                self.carry.set_downloaded(&task.id, path);
                self.queue.complete_download(task);
            }
            StageEvent::Finished {
                stage: Stage::Convert,
                task,
                outcome:
                    StageOutcome::Converted {
                        path,
                        duration,
                        bitrate,
                    },
            } => {
                self.carry.set_converted(&task.id, path, duration, bitrate);
                self.queue.complete_convert(task);
            }
            StageEvent::Finished {
                stage: Stage::Upload,
                task,
                ..
            } => {
                self.queue.complete_upload(&task.id);
                self.carry.remove(&task.id);
            }
            StageEvent::Finished { stage, task, .. } => {
                warn!(task_id = %task.id, stage = %stage, "Mismatched stage outcome, dropping task");
                self.queue.fail(&task.id, stage);
                self.carry.remove(&task.id);
            }
            StageEvent::Errored {
                stage,
                mut task,
                error,
            } => {
                error!(task_id = %task.id, stage = %stage, "Stage failed: {}", error);
                self.queue.fail(&task.id, stage);
                self.carry.remove(&task.id);

                // Failed runs on a fresh state instance; it posts /fail
                // with retries, so keep it off the event loop.
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    run_failed(&ctx, &mut task, error).await;
                });
            }
        }

        debug!(stats = ?self.queue.stats(), "Queue updated");
    }
}

fn in_flight_total(queue: &StageQueues) -> usize {
    let stats = queue.stats();
    stats.download.in_flight + stats.convert.in_flight + stats.upload.in_flight
}

/// Fixed-interval heartbeat; failures are logged (with suppression) and
/// never fatal.
async fn heartbeat_loop(
    client: ControlPlane,
    interval: Duration,
    encoder_hint: Encoder,
    hardware: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures = FailureTracker::default();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let (device_info, encoder) = probe_system(encoder_hint).await;
                hardware.store(encoder == Encoder::Hardware, Ordering::Relaxed);

                match client.heartbeat(&device_info, encoder).await {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            warn!("Heartbeat failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Poll for new tasks while the download stage has spare capacity; bind
/// races lose quietly.
async fn poll_loop(
    client: ControlPlane,
    queue: Arc<StageQueues>,
    carry: Arc<CarryStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if !queue.has_download_capacity() {
                    continue;
                }

                let remote = match client.get_task().await {
                    Ok(Some(remote)) => remote,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("getTask failed: {}", e);
                        continue;
                    }
                };

                if remote.status != TaskStatus::Waiting {
                    debug!(task_id = %remote.id, status = %remote.status, "Skipping non-waiting task");
                    continue;
                }

                match client.start_task(&remote.id).await {
                    Ok(true) => {
                        let task = remote.into_task();
                        info!(task_id = %task.id, priority = task.priority, "Bound task");
                        carry.insert(&task.id);
                        queue.add(task);
                    }
                    Ok(false) => {
                        debug!(task_id = %remote.id, "Lost bind race, skipping");
                    }
                    Err(e) => {
                        warn!(task_id = %remote.id, "start failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tracker_suppresses_after_threshold() {
        let mut tracker = FailureTracker::default();
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());

        tracker.record_success();
        assert!(tracker.record_failure());
    }
}
