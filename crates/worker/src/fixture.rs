use anyhow::Context;
use async_trait::async_trait;
use dispatch_core::types::{Attachment, Campaign, Message, Subscriber};
use dispatch_core::{MemoryStore, Messenger};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Campaign data for a local run against the in-memory store.
#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub audiences: Vec<Audience>,
    #[serde(default)]
    pub attachments: Vec<FixtureAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct Audience {
    pub campaign_id: i64,
    pub subscribers: Vec<Subscriber>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureAttachment {
    pub media_id: i64,
    pub name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Fixture {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing fixture {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn into_store(self) -> MemoryStore {
        let store = MemoryStore::new();
        for campaign in self.campaigns {
            store.insert_campaign(campaign);
        }
        for audience in self.audiences {
            store.insert_subscribers(audience.campaign_id, audience.subscribers);
        }
        for a in self.attachments {
            store.insert_attachment(
                a.media_id,
                Attachment {
                    name: a.name,
                    content_type: a.content_type,
                    content: a.content.into_bytes(),
                },
            );
        }
        store
    }
}

/// Messenger that logs each message instead of delivering it.
pub struct LogMessenger {
    name: String,
    pushed: AtomicU64,
}

impl LogMessenger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pushed: AtomicU64::new(0),
        }
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Messenger for LogMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, msg: Message) -> anyhow::Result<()> {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        info!(
            messenger = %self.name,
            to = ?msg.to,
            subject = %msg.subject,
            campaign = msg.campaign.as_ref().map(|c| c.id),
            bytes = msg.body.len(),
            attachments = msg.attachments.len(),
            "message"
        );
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
