use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const HEADER_CAMPAIGN_UUID: &str = "X-Dispatch-Campaign";
pub const HEADER_SUBSCRIBER_UUID: &str = "X-Dispatch-Subscriber";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Richtext,
    Html,
    Markdown,
    Plain,
    Visual,
}

impl ContentType {
    pub fn is_plain(&self) -> bool {
        matches!(self, ContentType::Plain)
    }
}

/// Per-campaign override of the sliding window limit: at most `rate`
/// messages are queued per `duration_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlidingWindowLimit {
    pub rate: usize,
    pub duration_secs: u64,
}

impl SlidingWindowLimit {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub subject: String,
    pub from_email: String,
    pub body: String,
    #[serde(default)]
    pub alt_body: Option<String>,
    /// Base layout wrapping the body. Includes the body with
    /// `{% include "content" %}`.
    #[serde(default)]
    pub template_body: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    pub status: CampaignStatus,
    pub messenger: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub media_ids: Vec<i64>,
    #[serde(default)]
    pub to_send: i64,
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub sliding_window: Option<SlidingWindowLimit>,
    #[serde(default)]
    pub attribs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub attribs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// MIME-style header list. Names compare case-insensitively and keep their
/// insertion order.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value stored under `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.push((name.to_string(), value.into()));
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A message handed to a messenger. Ad-hoc messages name their messenger;
/// campaign messages are built by the worker pool from the campaign.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub messenger: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub content_type: ContentType,
    pub body: Vec<u8>,
    pub alt_body: Vec<u8>,
    pub headers: Headers,
    pub attachments: Vec<Arc<Attachment>>,
    pub subscriber: Option<Subscriber>,
    pub campaign: Option<Arc<Campaign>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CampaignNotification {
    pub id: i64,
    pub name: String,
    pub status: CampaignStatus,
    pub sent: i64,
    pub to_send: i64,
    pub reason: String,
}

impl CampaignNotification {
    pub fn new(campaign: &Campaign, status: CampaignStatus, reason: &str) -> Self {
        Self {
            id: campaign.id,
            name: campaign.name.clone(),
            status,
            sent: campaign.sent,
            to_send: campaign.to_send,
            reason: reason.to_string(),
        }
    }

    /// `"Finished: Weekly digest"`
    pub fn subject(&self) -> String {
        let status = self.status.as_str();
        let mut chars = status.chars();
        let title = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        format!("{}: {}", title, self.name)
    }
}
