use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{Attachment, Campaign, CampaignStatus, Subscriber};

/// Data backend that supplies campaigns and subscribers and persists
/// dispatch progress. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `running` campaigns that are not in `current_ids`.
    /// `sent_deltas[i]` is the number of messages sent for `current_ids[i]`
    /// since the previous call.
    async fn next_campaigns(
        &self,
        current_ids: &[i64],
        sent_deltas: &[i64],
    ) -> anyhow::Result<Vec<Campaign>>;

    /// Returns up to `limit` subscribers of the campaign in ascending ID order,
    /// above the campaign's persisted watermark, and advances the watermark.
    async fn next_subscribers(
        &self,
        campaign_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscriber>>;

    async fn get_campaign(&self, campaign_id: i64) -> anyhow::Result<Campaign>;

    async fn update_campaign_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
    ) -> anyhow::Result<()>;

    /// `to_send` of 0 and `last_subscriber_id` of 0 leave the stored values
    /// untouched; `sent` is added to the stored count.
    async fn update_campaign_counts(
        &self,
        campaign_id: i64,
        to_send: i64,
        sent: i64,
        last_subscriber_id: i64,
    ) -> anyhow::Result<()>;

    /// Registers `url` for click tracking, or returns its existing UUID.
    async fn create_link(&self, url: &str) -> anyhow::Result<Uuid>;

    async fn get_attachment(&self, media_id: i64) -> anyhow::Result<Attachment>;

    async fn blocklist_subscriber(&self, subscriber_id: i64) -> anyhow::Result<()>;

    async fn delete_subscriber(&self, subscriber_id: i64) -> anyhow::Result<()>;
}
