use crate::error::{Error, Result};
use crate::funcs::{add_campaign_functions, add_generic_functions, CampaignFuncs};
use crate::links::LinkTracker;
use crate::message::{CampaignMessage, CompiledCampaign};
use crate::pipe::Pipe;
use crate::template::{CompiledTemplate, Template};
use dispatch_core::types::{
    Attachment, Campaign, CampaignNotification, CampaignStatus, Message, Subscriber,
};
use dispatch_core::{Config, Messenger, Notifier, Store};
use minijinja::Environment;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PUSH_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Senders {
    next_pipe: mpsc::UnboundedSender<Arc<Pipe>>,
    campaign: mpsc::Sender<CampaignMessage>,
    message: mpsc::Sender<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignStats {
    /// Messages sent over the last minute.
    pub send_rate: u64,
}

/// Owns the running campaigns and the worker pool that delivers their
/// messages.
pub struct Manager {
    pub(crate) cfg: Config,
    pub(crate) store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    messengers: RwLock<HashMap<String, Arc<dyn Messenger>>>,
    pub(crate) pipes: RwLock<HashMap<i64, Arc<Pipe>>>,
    tpls: RwLock<HashMap<i64, Arc<CompiledTemplate>>>,
    links: Arc<LinkTracker>,
    senders: RwLock<Option<Senders>>,
    next_pipe_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Pipe>>>>,
    pub(crate) campaign_rx: tokio::sync::Mutex<mpsc::Receiver<CampaignMessage>>,
    pub(crate) message_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    pub(crate) shutdown: CancellationToken,
}

impl Manager {
    pub fn new(cfg: Config, store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        let cfg = cfg.normalized();
        let (next_pipe_tx, next_pipe_rx) = mpsc::unbounded_channel();
        let (campaign_tx, campaign_rx) = mpsc::channel(cfg.concurrency * 2);
        let (message_tx, message_rx) = mpsc::channel(cfg.concurrency);
        let links = Arc::new(LinkTracker::new(store.clone(), cfg.urls.link_track.clone()));

        Arc::new(Self {
            cfg,
            store,
            notifier,
            messengers: RwLock::new(HashMap::new()),
            pipes: RwLock::new(HashMap::new()),
            tpls: RwLock::new(HashMap::new()),
            links,
            senders: RwLock::new(Some(Senders {
                next_pipe: next_pipe_tx,
                campaign: campaign_tx,
                message: message_tx,
            })),
            next_pipe_rx: Mutex::new(Some(next_pipe_rx)),
            campaign_rx: tokio::sync::Mutex::new(campaign_rx),
            message_rx: tokio::sync::Mutex::new(message_rx),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn add_messenger(&self, messenger: Arc<dyn Messenger>) -> Result<()> {
        let name = messenger.name().to_string();
        let mut messengers = self.messengers.write();
        if messengers.contains_key(&name) {
            return Err(Error::DuplicateMessenger(name));
        }
        info!(messenger = %name, "messenger loaded");
        messengers.insert(name, messenger);
        Ok(())
    }

    pub fn has_messenger(&self, name: &str) -> bool {
        self.messengers.read().contains_key(name)
    }

    pub(crate) fn messenger(&self, name: &str) -> Option<Arc<dyn Messenger>> {
        self.messengers.read().get(name).cloned()
    }

    pub fn has_running_campaigns(&self) -> bool {
        !self.pipes.read().is_empty()
    }

    pub fn campaign_stats(&self, id: i64) -> CampaignStats {
        let send_rate = self
            .pipes
            .read()
            .get(&id)
            .map(|pipe| pipe.rate.rate())
            .unwrap_or(0);
        CampaignStats { send_rate }
    }

    /// Stops a running campaign. Messages already queued for it are
    /// skipped. Returns false if the campaign is not running here.
    pub fn stop_campaign(&self, id: i64) -> bool {
        match self.pipes.read().get(&id) {
            Some(pipe) => {
                pipe.stop(false);
                true
            }
            None => false,
        }
    }

    /// Template environment with the generic functions only.
    pub fn generic_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        add_generic_functions(&mut env);
        env
    }

    /// Template environment with the generic and the campaign functions.
    pub fn campaign_environment(&self, campaign: &Campaign) -> Environment<'static> {
        let mut env = self.generic_environment();
        add_campaign_functions(
            &mut env,
            CampaignFuncs {
                links: self.links.clone(),
                urls: self.cfg.urls.clone(),
                campaign_uuid: campaign.uuid.to_string(),
                individual_tracking: self.cfg.individual_tracking,
            },
        );
        env
    }

    /// Compiles a campaign's templates without loading its attachments.
    pub fn compile_campaign(&self, campaign: Campaign) -> Result<Arc<CompiledCampaign>> {
        let env = self.campaign_environment(&campaign);
        CompiledCampaign::compile(env, campaign, Vec::new()).map(Arc::new)
    }

    pub(crate) async fn prepare_campaign(&self, campaign: &Campaign) -> Result<CompiledCampaign> {
        if !self.has_messenger(&campaign.messenger) {
            return Err(Error::UnknownMessenger {
                messenger: campaign.messenger.clone(),
                campaign: campaign.name.clone(),
            });
        }
        let env = self.campaign_environment(campaign);
        let attachments = self.load_attachments(campaign).await?;
        CompiledCampaign::compile(env, campaign.clone(), attachments)
    }

    async fn load_attachments(&self, campaign: &Campaign) -> Result<Vec<Arc<Attachment>>> {
        let mut attachments = Vec::with_capacity(campaign.media_ids.len());
        for &media_id in &campaign.media_ids {
            let attachment = self
                .store
                .get_attachment(media_id)
                .await
                .map_err(|source| Error::Attachment { media_id, source })?;
            attachments.push(Arc::new(attachment));
        }
        Ok(attachments)
    }

    /// Renders `campaign` for `subscriber` on the blocking pool.
    pub async fn new_campaign_message(
        &self,
        campaign: &Arc<CompiledCampaign>,
        subscriber: Subscriber,
    ) -> Result<CampaignMessage> {
        let campaign = campaign.clone();
        let unsubscribe_url = self.cfg.urls.unsubscribe.clone();
        let default_from = self.cfg.from_email.clone();
        tokio::task::spawn_blocking(move || {
            CampaignMessage::render(campaign, subscriber, &unsubscribe_url, &default_from)
        })
        .await?
    }

    /// Queues an ad-hoc message. Fails if the queue stays full for
    /// three seconds.
    pub async fn push_message(&self, msg: Message) -> Result<()> {
        let tx = self
            .senders
            .read()
            .as_ref()
            .map(|s| s.message.clone())
            .ok_or(Error::QueueClosed)?;

        let subject = msg.subject.clone();
        match tokio::time::timeout(PUSH_TIMEOUT, tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::QueueClosed),
            Err(_) => {
                warn!(%subject, "message push timed out");
                Err(Error::PushTimeout)
            }
        }
    }

    /// Queues a campaign message outside of a campaign run, loading the
    /// campaign's attachments first if the message has none.
    pub async fn push_campaign_message(&self, mut msg: CampaignMessage) -> Result<()> {
        if msg.attachments.is_empty() && !msg.campaign().media_ids.is_empty() {
            msg.attachments = self.load_attachments(msg.campaign()).await?;
        }

        let tx = self.campaign_sender().ok_or(Error::QueueClosed)?;
        let subject = msg.subject.clone();
        match tokio::time::timeout(PUSH_TIMEOUT, tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::QueueClosed),
            Err(_) => {
                warn!(%subject, "campaign message push timed out");
                Err(Error::PushTimeout)
            }
        }
    }

    /// Queues a message from a running pipe, waiting for room.
    pub(crate) async fn enqueue_campaign_message(&self, msg: CampaignMessage) -> Result<()> {
        let tx = self.campaign_sender().ok_or(Error::QueueClosed)?;
        tx.send(msg).await.map_err(|_| Error::QueueClosed)
    }

    fn campaign_sender(&self) -> Option<mpsc::Sender<CampaignMessage>> {
        self.senders.read().as_ref().map(|s| s.campaign.clone())
    }

    fn queue_pipe(&self, pipe: &Arc<Pipe>) -> bool {
        let tx = self.senders.read().as_ref().map(|s| s.next_pipe.clone());
        match tx {
            Some(tx) => tx.send(pipe.clone()).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remove_pipe(&self, id: i64) {
        self.pipes.write().remove(&id);
    }

    pub(crate) async fn send_notification(
        &self,
        campaign: &Campaign,
        status: CampaignStatus,
        reason: &str,
    ) {
        let notification = CampaignNotification::new(campaign, status, reason);
        let subject = notification.subject();
        if let Err(err) = self.notifier.notify(&subject, &notification).await {
            warn!(campaign = %campaign.name, error = %err, "error sending campaign notification");
        }
    }

    pub fn cache_tpl(&self, template: Template) -> Result<()> {
        let id = template.id;
        let compiled = CompiledTemplate::compile(self.generic_environment(), template)?;
        self.tpls.write().insert(id, Arc::new(compiled));
        Ok(())
    }

    pub fn get_tpl(&self, id: i64) -> Result<Arc<CompiledTemplate>> {
        self.tpls
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::TemplateNotFound(id))
    }

    pub fn delete_tpl(&self, id: i64) {
        self.tpls.write().remove(&id);
    }

    /// Starts the worker pool and the campaign scanner, then processes
    /// pipes until the manager is closed.
    pub async fn run(self: Arc<Self>) {
        let next_pipes = self.next_pipe_rx.lock().take();
        let Some(mut next_pipes) = next_pipes else {
            warn!("manager is already running");
            return;
        };

        let workers: Vec<_> = (0..self.cfg.concurrency)
            .map(|id| tokio::spawn(self.clone().worker(id)))
            .collect();
        if self.cfg.scan_campaigns {
            tokio::spawn(self.clone().scan_campaigns());
        }
        info!(concurrency = self.cfg.concurrency, "manager started");

        loop {
            let pipe = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                pipe = next_pipes.recv() => match pipe {
                    Some(pipe) => pipe,
                    None => break,
                },
            };

            match pipe.next_subscribers().await {
                Ok(true) => {
                    if !self.queue_pipe(&pipe) {
                        debug!(campaign = pipe.id(), "queue closed, dropping pipe");
                        pipe.interrupt();
                    }
                }
                Ok(false) => pipe.release(),
                Err(err) => {
                    error!(campaign = pipe.id(), error = %err, "error processing campaign batch");
                    pipe.interrupt();
                }
            }
        }

        // Pipes still fetching end here and persist their progress once
        // their queued messages are drained.
        let pipes: Vec<_> = self.pipes.read().values().cloned().collect();
        for pipe in pipes {
            pipe.interrupt();
        }
        for worker in workers {
            let _ = worker.await;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.wait_for_pipes())
            .await
            .is_err()
        {
            warn!("campaigns still running after shutdown grace period");
        }
        info!("manager stopped");
    }

    async fn wait_for_pipes(&self) {
        while self.has_running_campaigns() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn scan_campaigns(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let (ids, deltas) = self.current_campaigns();
            let campaigns = match self.store.next_campaigns(&ids, &deltas).await {
                Ok(campaigns) => campaigns,
                Err(err) => {
                    error!(error = %err, "error fetching campaigns");
                    self.restore_sent(&ids, &deltas);
                    continue;
                }
            };

            for campaign in campaigns {
                let name = campaign.name.clone();
                match Pipe::start(&self, campaign).await {
                    Ok(pipe) => {
                        info!(campaign = %name, "start processing campaign");
                        if !self.queue_pipe(&pipe) {
                            pipe.interrupt();
                            return;
                        }
                    }
                    Err(err) => error!(campaign = %name, error = %err, "error processing campaign"),
                }
            }
        }
    }

    /// IDs of the running campaigns and the messages each has sent since the
    /// previous call.
    fn current_campaigns(&self) -> (Vec<i64>, Vec<i64>) {
        let pipes = self.pipes.read();
        pipes
            .iter()
            .map(|(id, pipe)| (*id, pipe.take_sent()))
            .unzip()
    }

    fn restore_sent(&self, ids: &[i64], deltas: &[i64]) {
        let pipes = self.pipes.read();
        for (id, n) in ids.iter().zip(deltas) {
            if let Some(pipe) = pipes.get(id) {
                pipe.restore_sent(*n);
            }
        }
    }

    /// Closes the queues. Workers finish what is already queued and exit;
    /// the scanner and the batch loop stop right away.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.senders.write().take();
        info!("manager closing");
    }
}
