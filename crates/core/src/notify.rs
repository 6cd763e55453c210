use async_trait::async_trait;
use tracing::info;

use crate::types::CampaignNotification;

/// Receives campaign lifecycle notifications meant for administrators.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, notification: &CampaignNotification)
        -> anyhow::Result<()>;
}

/// Notifier that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        subject: &str,
        notification: &CampaignNotification,
    ) -> anyhow::Result<()> {
        info!(
            campaign_id = notification.id,
            status = %notification.status,
            sent = notification.sent,
            reason = %notification.reason,
            "{}",
            subject
        );
        Ok(())
    }
}
