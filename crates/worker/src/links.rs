use dispatch_core::config::fill_url;
use dispatch_core::Store;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;
use uuid::Uuid;

/// Rewrites URLs into tracking URLs, registering each distinct URL with the
/// store once.
pub(crate) struct LinkTracker {
    store: Arc<dyn Store>,
    url_template: String,
    links: RwLock<HashMap<String, Uuid>>,
}

impl LinkTracker {
    pub(crate) fn new(store: Arc<dyn Store>, url_template: String) -> Self {
        Self {
            store,
            url_template,
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Called from template rendering, which runs on the blocking pool. On a
    /// cache miss the link is registered synchronously; if that fails the
    /// untracked URL is returned.
    pub(crate) fn track(&self, url: &str, campaign_uuid: &str, subscriber_uuid: &str) -> String {
        let url = url.replace("&amp;", "&");

        let cached = self.links.read().get(&url).copied();
        let link = match cached {
            Some(link) => link,
            None => match self.register(&url) {
                Ok(link) => {
                    self.links.write().insert(url, link);
                    link
                }
                Err(err) => {
                    warn!(%url, error = %err, "error registering tracking link");
                    return url;
                }
            },
        };

        fill_url(
            &self.url_template,
            &[&link.to_string(), campaign_uuid, subscriber_uuid],
        )
    }

    fn register(&self, url: &str) -> anyhow::Result<Uuid> {
        let handle = Handle::try_current()?;
        handle.block_on(self.store.create_link(url))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.links.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::MemoryStore;

    const TEMPLATE: &str = "https://lists.example.com/link/%s/%s/%s";

    #[tokio::test(flavor = "multi_thread")]
    async fn test_track_registers_each_url_once() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(LinkTracker::new(store.clone(), TEMPLATE.to_string()));

        let (a, b) = tokio::task::spawn_blocking({
            let tracker = tracker.clone();
            move || {
                let a = tracker.track("https://example.com/?a=1&amp;b=2", "camp", "sub");
                let b = tracker.track("https://example.com/?a=1&b=2", "camp", "sub");
                (a, b)
            }
        })
        .await
        .unwrap();

        assert_eq!(a, b);
        assert!(a.starts_with("https://lists.example.com/link/"));
        assert!(a.ends_with("/camp/sub"));
        assert_eq!(tracker.len(), 1);
        assert_eq!(store.link_count(), 1);
    }

    #[test]
    fn test_track_outside_runtime_falls_back_to_raw_url() {
        let tracker = LinkTracker::new(Arc::new(MemoryStore::new()), TEMPLATE.to_string());
        let url = tracker.track("https://example.com/?x=1&amp;y=2", "camp", "sub");
        assert_eq!(url, "https://example.com/?x=1&y=2");
        assert_eq!(tracker.len(), 0);
    }
}
