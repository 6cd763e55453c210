use crate::manager::Manager;
use crate::message::CampaignMessage;
use dispatch_core::types::{Headers, Message, HEADER_CAMPAIGN_UUID, HEADER_SUBSCRIBER_UUID};
use dispatch_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

impl Manager {
    /// Delivers queued messages until both queues are closed and drained.
    pub(crate) async fn worker(self: Arc<Self>, id: usize) {
        let mut campaign_open = true;
        let mut message_open = true;
        let mut sent_this_second = 0;

        while campaign_open || message_open {
            tokio::select! {
                msg = recv(&self.campaign_rx), if campaign_open => match msg {
                    Some(msg) => self.deliver_campaign_message(msg, &mut sent_this_second).await,
                    None => campaign_open = false,
                },
                msg = recv(&self.message_rx), if message_open => match msg {
                    Some(msg) => self.deliver_message(msg).await,
                    None => message_open = false,
                },
            }
        }
        debug!(worker = id, "worker stopped");
    }

    async fn deliver_campaign_message(&self, msg: CampaignMessage, sent_this_second: &mut usize) {
        let pipe = msg.pipe.clone();
        if let Some(pipe) = &pipe {
            if pipe.is_stopped() {
                pipe.done();
                return;
            }
        }

        if *sent_this_second >= self.cfg.message_rate {
            tokio::time::sleep(Duration::from_secs(1)).await;
            *sent_this_second = 0;
        }
        *sent_this_second += 1;

        let subscriber_id = msg.subscriber.id;
        let campaign = msg.campaign().name.clone();
        let messenger = msg.campaign().messenger.clone();
        let out = outbound_message(&self.cfg, msg);

        let result = match self.messenger(&messenger) {
            Some(m) => m.push(out).await,
            None => Err(anyhow::anyhow!("unknown messenger {messenger}")),
        };
        if let Err(err) = &result {
            error!(%campaign, error = %err, "error sending message");
        }

        if let Some(pipe) = pipe {
            match result {
                Ok(()) => pipe.on_sent(subscriber_id),
                Err(_) => pipe.on_error(),
            }
            pipe.done();
        }
    }

    async fn deliver_message(&self, msg: Message) {
        let Some(messenger) = self.messenger(&msg.messenger) else {
            error!(messenger = %msg.messenger, "unknown messenger for message");
            return;
        };
        let subject = msg.subject.clone();
        if let Err(err) = messenger.push(msg).await {
            error!(%subject, error = %err, "error sending message");
        }
    }
}

async fn recv<T>(rx: &tokio::sync::Mutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

/// Builds the messenger-facing message for a rendered campaign message.
pub(crate) fn outbound_message(cfg: &Config, msg: CampaignMessage) -> Message {
    let campaign = msg.campaign.campaign_arc();

    let mut headers = Headers::new();
    headers.set(HEADER_CAMPAIGN_UUID, campaign.uuid.to_string());
    headers.set(HEADER_SUBSCRIBER_UUID, msg.subscriber.uuid.to_string());
    if cfg.unsub_header {
        headers.set("List-Unsubscribe-Post", "List-Unsubscribe=One-Click");
        headers.set("List-Unsubscribe", format!("<{}>", msg.unsubscribe_url));
    }
    for header in msg.headers {
        headers.add(&header.name, header.value);
    }

    Message {
        messenger: campaign.messenger.clone(),
        from: msg.from,
        to: vec![msg.to],
        subject: msg.subject,
        content_type: campaign.content_type,
        body: msg.body,
        alt_body: msg.alt_body,
        headers,
        attachments: msg.attachments,
        subscriber: Some(msg.subscriber),
        campaign: Some(campaign),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcs::add_generic_functions;
    use crate::message::CompiledCampaign;
    use dispatch_core::types::{Campaign, CampaignStatus, ContentType, Header, Subscriber};
    use minijinja::Environment;
    use uuid::Uuid;

    fn rendered(cfg: &Config) -> (Campaign, Subscriber, CampaignMessage) {
        let campaign = Campaign {
            id: 3,
            uuid: Uuid::new_v4(),
            name: "Digest".to_string(),
            subject: "News".to_string(),
            from_email: "news@example.com".to_string(),
            body: "hello".to_string(),
            alt_body: None,
            template_body: None,
            content_type: ContentType::Markdown,
            status: CampaignStatus::Running,
            messenger: "email".to_string(),
            headers: vec![Header {
                name: "Reply-To".to_string(),
                value: "help@example.com".to_string(),
            }],
            media_ids: Vec::new(),
            to_send: 1,
            sent: 0,
            sliding_window: None,
            attribs: Default::default(),
        };
        let subscriber = Subscriber {
            id: 9,
            uuid: Uuid::new_v4(),
            email: "bo@example.com".to_string(),
            name: "Bo".to_string(),
            attribs: Default::default(),
        };

        let mut env = Environment::new();
        add_generic_functions(&mut env);
        let compiled =
            Arc::new(CompiledCampaign::compile(env, campaign.clone(), Vec::new()).unwrap());
        let msg = CampaignMessage::render(
            compiled,
            subscriber.clone(),
            &cfg.urls.unsubscribe,
            &cfg.from_email,
        )
        .unwrap();
        (campaign, subscriber, msg)
    }

    #[test]
    fn test_outbound_message_carries_tracking_headers() {
        let cfg = Config::default();
        let (campaign, subscriber, msg) = rendered(&cfg);
        let out = outbound_message(&cfg, msg);

        assert_eq!(out.messenger, "email");
        assert_eq!(out.to, vec!["Bo <bo@example.com>".to_string()]);
        assert_eq!(out.content_type, ContentType::Markdown);
        assert_eq!(out.body, b"hello");
        let campaign_uuid = campaign.uuid.to_string();
        let subscriber_uuid = subscriber.uuid.to_string();
        assert_eq!(out.headers.get(HEADER_CAMPAIGN_UUID), Some(campaign_uuid.as_str()));
        assert_eq!(out.headers.get(HEADER_SUBSCRIBER_UUID), Some(subscriber_uuid.as_str()));
        assert_eq!(out.headers.get("Reply-To"), Some("help@example.com"));
        let unsubscribe = format!(
            "<http://localhost:9000/subscription/{}/{}>",
            campaign.uuid, subscriber.uuid
        );
        assert_eq!(out.headers.get("List-Unsubscribe"), Some(unsubscribe.as_str()));
        assert_eq!(
            out.headers.get("List-Unsubscribe-Post"),
            Some("List-Unsubscribe=One-Click")
        );
        assert_eq!(out.subscriber.map(|s| s.id), Some(9));
    }

    #[test]
    fn test_outbound_message_without_unsubscribe_header() {
        let cfg = Config {
            unsub_header: false,
            ..Config::default()
        };
        let (_, _, msg) = rendered(&cfg);
        let out = outbound_message(&cfg, msg);

        assert!(out.headers.get("List-Unsubscribe").is_none());
        assert_eq!(out.headers.len(), 3);
    }
}
