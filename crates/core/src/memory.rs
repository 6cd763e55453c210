use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::store::Store;
use crate::types::{Attachment, Campaign, CampaignStatus, Subscriber};

#[derive(Default)]
struct State {
    campaigns: BTreeMap<i64, Campaign>,
    audiences: HashMap<i64, Vec<Subscriber>>,
    watermarks: HashMap<i64, i64>,
    attachments: HashMap<i64, Attachment>,
    links: HashMap<String, Uuid>,
    blocklisted: HashSet<i64>,
    batches: HashMap<i64, Vec<usize>>,
    status_history: HashMap<i64, Vec<CampaignStatus>>,
}

/// In-process [`Store`]. Campaign progress lives only as long as the value.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.state.lock().campaigns.insert(campaign.id, campaign);
    }

    /// Adds subscribers to a campaign's audience, keeping it sorted by ID.
    pub fn insert_subscribers(&self, campaign_id: i64, subscribers: Vec<Subscriber>) {
        let mut state = self.state.lock();
        let audience = state.audiences.entry(campaign_id).or_default();
        audience.extend(subscribers);
        audience.sort_by_key(|s| s.id);
        audience.dedup_by_key(|s| s.id);
    }

    pub fn insert_attachment(&self, media_id: i64, attachment: Attachment) {
        self.state.lock().attachments.insert(media_id, attachment);
    }

    /// Changes a campaign's status from outside the engine, the way an
    /// operator pausing or cancelling a campaign would.
    pub fn set_status(&self, campaign_id: i64, status: CampaignStatus) {
        if let Some(c) = self.state.lock().campaigns.get_mut(&campaign_id) {
            c.status = status;
        }
    }

    pub fn campaign(&self, campaign_id: i64) -> Option<Campaign> {
        self.state.lock().campaigns.get(&campaign_id).cloned()
    }

    /// Sizes of the non-empty subscriber batches handed out for a campaign.
    pub fn batch_sizes(&self, campaign_id: i64) -> Vec<usize> {
        self.state
            .lock()
            .batches
            .get(&campaign_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Statuses written through [`Store::update_campaign_status`], in order.
    pub fn status_history(&self, campaign_id: i64) -> Vec<CampaignStatus> {
        self.state
            .lock()
            .status_history
            .get(&campaign_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn watermark(&self, campaign_id: i64) -> i64 {
        self.state
            .lock()
            .watermarks
            .get(&campaign_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn is_blocklisted(&self, subscriber_id: i64) -> bool {
        self.state.lock().blocklisted.contains(&subscriber_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn next_campaigns(
        &self,
        current_ids: &[i64],
        sent_deltas: &[i64],
    ) -> anyhow::Result<Vec<Campaign>> {
        let mut state = self.state.lock();

        for (id, delta) in current_ids.iter().zip(sent_deltas) {
            if let Some(c) = state.campaigns.get_mut(id) {
                c.sent += delta;
            }
        }

        Ok(state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Running && !current_ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn next_subscribers(
        &self,
        campaign_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscriber>> {
        let mut state = self.state.lock();

        let running = state
            .campaigns
            .get(&campaign_id)
            .map(|c| c.status == CampaignStatus::Running)
            .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))?;
        if !running {
            return Ok(Vec::new());
        }

        let watermark = state.watermarks.get(&campaign_id).copied().unwrap_or(0);
        let batch: Vec<Subscriber> = state
            .audiences
            .get(&campaign_id)
            .map(|audience| {
                audience
                    .iter()
                    .filter(|s| s.id > watermark && !state.blocklisted.contains(&s.id))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(last) = batch.last() {
            state.watermarks.insert(campaign_id, last.id);
            state.batches.entry(campaign_id).or_default().push(batch.len());
        }

        Ok(batch)
    }

    async fn get_campaign(&self, campaign_id: i64) -> anyhow::Result<Campaign> {
        self.state
            .lock()
            .campaigns
            .get(&campaign_id)
            .cloned()
            .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))
    }

    async fn update_campaign_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let campaign = state
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))?;
        campaign.status = status;
        state
            .status_history
            .entry(campaign_id)
            .or_default()
            .push(status);
        Ok(())
    }

    async fn update_campaign_counts(
        &self,
        campaign_id: i64,
        to_send: i64,
        sent: i64,
        last_subscriber_id: i64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let campaign = state
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))?;
        if to_send != 0 {
            campaign.to_send = to_send;
        }
        campaign.sent += sent;
        if last_subscriber_id > 0 {
            state.watermarks.insert(campaign_id, last_subscriber_id);
        }
        Ok(())
    }

    async fn create_link(&self, url: &str) -> anyhow::Result<Uuid> {
        let mut state = self.state.lock();
        Ok(*state
            .links
            .entry(url.to_string())
            .or_insert_with(Uuid::new_v4))
    }

    async fn get_attachment(&self, media_id: i64) -> anyhow::Result<Attachment> {
        self.state
            .lock()
            .attachments
            .get(&media_id)
            .cloned()
            .ok_or_else(|| anyhow!("media {media_id} not found"))
    }

    async fn blocklist_subscriber(&self, subscriber_id: i64) -> anyhow::Result<()> {
        self.state.lock().blocklisted.insert(subscriber_id);
        Ok(())
    }

    async fn delete_subscriber(&self, subscriber_id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for audience in state.audiences.values_mut() {
            audience.retain(|s| s.id != subscriber_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;

    fn campaign(id: i64, status: CampaignStatus) -> Campaign {
        Campaign {
            id,
            uuid: Uuid::new_v4(),
            name: format!("campaign-{id}"),
            subject: "Hello".to_string(),
            from_email: "news@example.com".to_string(),
            body: "Hi".to_string(),
            alt_body: None,
            template_body: None,
            content_type: ContentType::Plain,
            status,
            messenger: "email".to_string(),
            headers: vec![],
            media_ids: vec![],
            to_send: 0,
            sent: 0,
            sliding_window: None,
            attribs: Default::default(),
        }
    }

    fn subscribers(ids: std::ops::RangeInclusive<i64>) -> Vec<Subscriber> {
        ids.map(|id| Subscriber {
            id,
            uuid: Uuid::new_v4(),
            email: format!("user{id}@example.com"),
            name: format!("User {id}"),
            attribs: Default::default(),
        })
        .collect()
    }

    #[tokio::test]
    async fn test_next_campaigns_excludes_current_and_applies_deltas() {
        let store = MemoryStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Running));
        store.insert_campaign(campaign(2, CampaignStatus::Running));
        store.insert_campaign(campaign(3, CampaignStatus::Draft));

        let next = store.next_campaigns(&[1], &[7]).await.unwrap();
        let ids: Vec<i64> = next.iter().map(|c| c.id).collect();

        assert_eq!(ids, vec![2]);
        assert_eq!(store.campaign(1).unwrap().sent, 7);
    }

    #[tokio::test]
    async fn test_next_subscribers_pages_by_watermark() {
        let store = MemoryStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Running));
        store.insert_subscribers(1, subscribers(1..=5));

        let first = store.next_subscribers(1, 2).await.unwrap();
        let second = store.next_subscribers(1, 2).await.unwrap();
        let third = store.next_subscribers(1, 2).await.unwrap();
        let fourth = store.next_subscribers(1, 2).await.unwrap();

        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(third.iter().map(|s| s.id).collect::<Vec<_>>(), vec![5]);
        assert!(fourth.is_empty());
        assert_eq!(store.batch_sizes(1), vec![2, 2, 1]);
        assert_eq!(store.watermark(1), 5);
    }

    #[tokio::test]
    async fn test_next_subscribers_is_empty_once_not_running() {
        let store = MemoryStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Running));
        store.insert_subscribers(1, subscribers(1..=3));
        store.set_status(1, CampaignStatus::Paused);

        assert!(store.next_subscribers(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_subscribers_unknown_campaign_fails() {
        let store = MemoryStore::new();
        assert!(store.next_subscribers(9, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_create_link_is_stable_per_url() {
        let store = MemoryStore::new();
        let a = store.create_link("https://example.com/a").await.unwrap();
        let again = store.create_link("https://example.com/a").await.unwrap();
        let b = store.create_link("https://example.com/b").await.unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(store.link_count(), 2);
    }

    #[tokio::test]
    async fn test_update_counts_keeps_zero_fields() {
        let store = MemoryStore::new();
        let mut c = campaign(1, CampaignStatus::Running);
        c.to_send = 100;
        store.insert_campaign(c);

        store.update_campaign_counts(1, 0, 4, 0).await.unwrap();
        store.update_campaign_counts(1, 0, 3, 42).await.unwrap();

        let c = store.campaign(1).unwrap();
        assert_eq!(c.to_send, 100);
        assert_eq!(c.sent, 7);
        assert_eq!(store.watermark(1), 42);
    }

    #[tokio::test]
    async fn test_blocklisted_and_deleted_subscribers_are_skipped() {
        let store = MemoryStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Running));
        store.insert_subscribers(1, subscribers(1..=4));

        store.blocklist_subscriber(2).await.unwrap();
        store.delete_subscriber(3).await.unwrap();

        let batch = store.next_subscribers(1, 10).await.unwrap();
        assert_eq!(batch.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 4]);
        assert!(store.is_blocklisted(2));
    }

    #[tokio::test]
    async fn test_status_updates_are_recorded() {
        let store = MemoryStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Running));

        store
            .update_campaign_status(1, CampaignStatus::Finished)
            .await
            .unwrap();

        assert_eq!(store.status_history(1), vec![CampaignStatus::Finished]);
        assert_eq!(
            store.get_campaign(1).await.unwrap().status,
            CampaignStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_missing_attachment_fails() {
        let store = MemoryStore::new();
        store.insert_attachment(
            1,
            Attachment {
                name: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                content: b"hi".to_vec(),
            },
        );

        assert_eq!(store.get_attachment(1).await.unwrap().content, b"hi".to_vec());
        assert!(store.get_attachment(2).await.is_err());
    }
}
