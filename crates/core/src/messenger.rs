use async_trait::async_trait;

use crate::types::Message;

/// A named delivery backend such as SMTP or an HTTP postback.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, message: Message) -> anyhow::Result<()>;

    async fn flush(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}
