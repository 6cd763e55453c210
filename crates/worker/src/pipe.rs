use crate::error::{Error, Result};
use crate::latch::CompletionLatch;
use crate::manager::Manager;
use crate::message::CompiledCampaign;
use crate::rate::{RateCounter, SlidingWindow};
use dispatch_core::types::{Campaign, CampaignStatus};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// One running campaign: pulls subscriber batches, tracks in-flight
/// messages and finalises the campaign once they have all been handled.
pub(crate) struct Pipe {
    pub(crate) campaign: Arc<CompiledCampaign>,
    pub(crate) rate: RateCounter,
    latch: CompletionLatch,
    sent: AtomicI64,
    last_id: AtomicI64,
    errors: AtomicU64,
    stopped: AtomicBool,
    with_errors: AtomicBool,
    interrupted: AtomicBool,
    released: AtomicBool,
    window: Mutex<Option<SlidingWindow>>,
    manager: Arc<Manager>,
}

impl Pipe {
    /// Prepares `campaign` for sending and registers the pipe with the
    /// manager. Any failure here pauses the campaign.
    pub(crate) async fn start(manager: &Arc<Manager>, campaign: Campaign) -> Result<Arc<Self>> {
        let compiled = match manager.prepare_campaign(&campaign).await {
            Ok(compiled) => compiled,
            Err(err) => {
                error!(campaign = %campaign.name, error = %err, "error starting campaign, pausing");
                if let Err(err) = manager
                    .store
                    .update_campaign_status(campaign.id, CampaignStatus::Paused)
                    .await
                {
                    error!(campaign = %campaign.name, error = %err, "error pausing campaign");
                }
                return Err(err);
            }
        };

        let cfg = &manager.cfg;
        let window = match compiled.campaign().sliding_window {
            Some(limit) => SlidingWindow::new(limit.rate, limit.duration()),
            None if cfg.sliding_window => {
                SlidingWindow::new(cfg.sliding_window_rate, cfg.sliding_window_duration)
            }
            None => None,
        };

        let pipe = Arc::new(Self {
            campaign: Arc::new(compiled),
            rate: RateCounter::per_minute(),
            latch: CompletionLatch::new(1),
            sent: AtomicI64::new(0),
            last_id: AtomicI64::new(0),
            errors: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            with_errors: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            released: AtomicBool::new(false),
            window: Mutex::new(window),
            manager: manager.clone(),
        });
        manager.pipes.write().insert(pipe.id(), pipe.clone());

        let watcher = pipe.clone();
        tokio::spawn(async move {
            watcher.latch.wait().await;
            watcher.stop(false);
            watcher.cleanup().await;
        });

        Ok(pipe)
    }

    pub(crate) fn id(&self) -> i64 {
        self.campaign.campaign().id
    }

    fn name(&self) -> &str {
        &self.campaign.campaign().name
    }

    /// Fetches the next batch and queues a message per subscriber. Returns
    /// false once the campaign has nothing left to send.
    pub(crate) async fn next_subscribers(self: &Arc<Self>) -> Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }

        let m = &self.manager;
        let subscribers = m
            .store
            .next_subscribers(self.id(), m.cfg.batch_size)
            .await
            .map_err(Error::Store)?;
        if subscribers.is_empty() {
            return Ok(false);
        }

        let mut window = self.window.lock().await;
        for subscriber in subscribers {
            if self.is_stopped() {
                break;
            }

            let email = subscriber.email.clone();
            let msg = match m.new_campaign_message(&self.campaign, subscriber).await {
                Ok(msg) => msg.with_pipe(self.clone()),
                Err(err) => {
                    error!(campaign = %self.name(), subscriber = %email, error = %err, "error rendering message");
                    continue;
                }
            };

            self.latch.add(1);
            if let Err(err) = m.enqueue_campaign_message(msg).await {
                self.latch.done();
                return Err(err);
            }

            if let Some(window) = window.as_mut() {
                window.record(&m.shutdown).await;
                if m.shutdown.is_cancelled() {
                    return Err(Error::QueueClosed);
                }
            }
        }

        Ok(true)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Marks the pipe stopped. Queued messages are skipped from here on.
    /// Only the first call decides whether the stop counts as an error.
    pub(crate) fn stop(&self, with_errors: bool) {
        if self.is_stopped() {
            return;
        }
        if with_errors {
            self.with_errors.store(true, Ordering::Release);
        }
        self.stopped.store(true, Ordering::Release);
    }

    /// Ends the run without finalising the campaign, which keeps its status
    /// so a later scan picks it up again. Messages already queued are still
    /// delivered.
    pub(crate) fn interrupt(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.interrupted.store(true, Ordering::Release);
            self.latch.done();
        }
    }

    /// Releases the unit held while batches are still being fetched.
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.latch.done();
        }
    }

    /// Marks one queued message as handled.
    pub(crate) fn done(&self) {
        self.latch.done();
    }

    pub(crate) fn on_sent(&self, subscriber_id: i64) {
        self.last_id.fetch_max(subscriber_id, Ordering::AcqRel);
        self.sent.fetch_add(1, Ordering::AcqRel);
        self.rate.incr(1);
    }

    pub(crate) fn on_error(&self) {
        let max = self.manager.cfg.max_send_errors;
        if max < 1 {
            return;
        }

        let count = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count < max {
            return;
        }

        if !self.is_stopped() {
            warn!(campaign = %self.name(), errors = count, "error threshold reached, stopping campaign");
        }
        self.stop(true);
    }

    /// Sent count since the last call.
    pub(crate) fn take_sent(&self) -> i64 {
        self.sent.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn restore_sent(&self, n: i64) {
        self.sent.fetch_add(n, Ordering::AcqRel);
    }

    async fn cleanup(&self) {
        let m = &self.manager;
        let id = self.id();

        let sent = self.take_sent();
        let last_id = self.last_id.load(Ordering::Acquire);
        if let Err(err) = m.store.update_campaign_counts(id, 0, sent, last_id).await {
            error!(campaign = %self.name(), error = %err, "error updating campaign counts");
        }

        if self.with_errors.load(Ordering::Acquire) {
            if let Err(err) = m.store.update_campaign_status(id, CampaignStatus::Paused).await {
                error!(campaign = %self.name(), error = %err, "error pausing campaign");
            } else {
                info!(campaign = %self.name(), "campaign paused");
            }
            let campaign = self.latest_campaign().await;
            m.send_notification(&campaign, CampaignStatus::Paused, "Too many errors")
                .await;
        } else if self.interrupted.load(Ordering::Acquire) {
            info!(campaign = %self.name(), "campaign processing interrupted");
        } else {
            match m.store.get_campaign(id).await {
                Ok(mut campaign) => {
                    if campaign.status == CampaignStatus::Running {
                        match m.store.update_campaign_status(id, CampaignStatus::Finished).await {
                            Ok(()) => {
                                campaign.status = CampaignStatus::Finished;
                                info!(campaign = %self.name(), "campaign finished");
                            }
                            Err(err) => {
                                error!(campaign = %self.name(), error = %err, "error finishing campaign")
                            }
                        }
                    } else {
                        info!(campaign = %self.name(), status = %campaign.status, "stop processing campaign");
                    }
                    m.send_notification(&campaign, campaign.status, "").await;
                }
                Err(err) => {
                    error!(campaign = %self.name(), error = %err, "error fetching campaign for cleanup")
                }
            }
        }

        m.remove_pipe(id);
    }

    async fn latest_campaign(&self) -> Campaign {
        match self.manager.store.get_campaign(self.id()).await {
            Ok(campaign) => campaign,
            Err(_) => self.campaign.campaign().clone(),
        }
    }
}
