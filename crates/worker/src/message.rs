use crate::error::{Error, Result};
use crate::pipe::Pipe;
use dispatch_core::config::fill_url;
use dispatch_core::types::{Attachment, Campaign, Header, Subscriber};
use minijinja::{AutoEscape, Environment};
use serde::Serialize;
use std::sync::Arc;

const BASE_TPL: &str = "base";
const CONTENT_TPL: &str = "content";
const SUBJECT_TPL: &str = "subject";
const ALT_BODY_TPL: &str = "altbody";
const DEFAULT_BASE: &str = r#"{% include "content" %}"#;

fn is_dynamic(source: &str) -> bool {
    source.contains("{{") || source.contains("{%")
}

/// A campaign with its templates compiled, shared by every message of a run.
pub struct CompiledCampaign {
    campaign: Arc<Campaign>,
    env: Environment<'static>,
    subject_tpl: bool,
    alt_body_tpl: bool,
    header_tpls: Vec<Option<String>>,
    attachments: Vec<Arc<Attachment>>,
}

impl CompiledCampaign {
    /// Compiles the body (wrapped in the campaign's base template), and the
    /// subject, alt body and header values when they contain template tags.
    pub(crate) fn compile(
        mut env: Environment<'static>,
        campaign: Campaign,
        attachments: Vec<Arc<Attachment>>,
    ) -> Result<Self> {
        let html = !campaign.content_type.is_plain();
        env.set_auto_escape_callback(move |name| {
            if html && (name == BASE_TPL || name == CONTENT_TPL) {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });

        let base = campaign
            .template_body
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        env.add_template_owned(CONTENT_TPL, campaign.body.clone())
            .map_err(Error::Compile)?;
        env.add_template_owned(BASE_TPL, base)
            .map_err(Error::Compile)?;

        let subject_tpl = is_dynamic(&campaign.subject);
        if subject_tpl {
            env.add_template_owned(SUBJECT_TPL, campaign.subject.clone())
                .map_err(Error::Compile)?;
        }

        let mut alt_body_tpl = false;
        if let Some(alt) = campaign.alt_body.as_ref().filter(|_| html) {
            if is_dynamic(alt) {
                env.add_template_owned(ALT_BODY_TPL, alt.clone())
                    .map_err(Error::Compile)?;
                alt_body_tpl = true;
            }
        }

        let mut header_tpls = Vec::with_capacity(campaign.headers.len());
        for (i, header) in campaign.headers.iter().enumerate() {
            if is_dynamic(&header.value) {
                let name = format!("header.{i}");
                env.add_template_owned(name.clone(), header.value.clone())
                    .map_err(Error::Compile)?;
                header_tpls.push(Some(name));
            } else {
                header_tpls.push(None);
            }
        }

        Ok(Self {
            campaign: Arc::new(campaign),
            env,
            subject_tpl,
            alt_body_tpl,
            header_tpls,
            attachments,
        })
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub(crate) fn campaign_arc(&self) -> Arc<Campaign> {
        self.campaign.clone()
    }

    pub fn attachments(&self) -> &[Arc<Attachment>] {
        &self.attachments
    }

    fn render_tpl(&self, name: &str, ctx: &RenderContext<'_>) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|tpl| tpl.render(ctx))
            .map_err(Error::Render)
    }
}

#[derive(Serialize)]
struct RenderContext<'a> {
    #[serde(rename = "Campaign")]
    campaign: &'a Campaign,
    #[serde(rename = "Subscriber")]
    subscriber: &'a Subscriber,
}

/// A campaign rendered for one subscriber.
pub struct CampaignMessage {
    pub(crate) campaign: Arc<CompiledCampaign>,
    pub(crate) subscriber: Subscriber,
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) subject: String,
    pub(crate) body: Vec<u8>,
    pub(crate) alt_body: Vec<u8>,
    pub(crate) unsubscribe_url: String,
    pub(crate) headers: Vec<Header>,
    pub(crate) attachments: Vec<Arc<Attachment>>,
    pub(crate) pipe: Option<Arc<Pipe>>,
}

impl CampaignMessage {
    /// Renders every template of `campaign` for `subscriber`. Runs the
    /// template engine synchronously. `default_from` is used when the
    /// campaign has no sender of its own.
    pub(crate) fn render(
        campaign: Arc<CompiledCampaign>,
        subscriber: Subscriber,
        unsubscribe_url: &str,
        default_from: &str,
    ) -> Result<Self> {
        let c = campaign.campaign();
        let unsubscribe_url = fill_url(
            unsubscribe_url,
            &[&c.uuid.to_string(), &subscriber.uuid.to_string()],
        );
        let ctx = RenderContext {
            campaign: c,
            subscriber: &subscriber,
        };

        let body = campaign.render_tpl(BASE_TPL, &ctx)?.into_bytes();

        let subject = if campaign.subject_tpl {
            campaign.render_tpl(SUBJECT_TPL, &ctx)?
        } else {
            c.subject.clone()
        };

        let alt_body = match c.alt_body.as_ref() {
            Some(_) if campaign.alt_body_tpl => {
                campaign.render_tpl(ALT_BODY_TPL, &ctx)?.into_bytes()
            }
            Some(alt) if !c.content_type.is_plain() => alt.clone().into_bytes(),
            _ => Vec::new(),
        };

        let mut headers = Vec::with_capacity(c.headers.len());
        for (header, tpl) in c.headers.iter().zip(&campaign.header_tpls) {
            let value = match tpl {
                Some(name) => campaign.render_tpl(name, &ctx)?,
                None => header.value.clone(),
            };
            headers.push(Header {
                name: header.name.clone(),
                value,
            });
        }

        let to = if subscriber.name.is_empty() {
            subscriber.email.clone()
        } else {
            format!("{} <{}>", subscriber.name, subscriber.email)
        };

        let from = if c.from_email.is_empty() {
            default_from.to_string()
        } else {
            c.from_email.clone()
        };

        Ok(Self {
            from,
            attachments: campaign.attachments.clone(),
            to,
            subject,
            body,
            alt_body,
            unsubscribe_url,
            headers,
            subscriber,
            campaign,
            pipe: None,
        })
    }

    pub(crate) fn with_pipe(mut self, pipe: Arc<Pipe>) -> Self {
        self.pipe = Some(pipe);
        self
    }

    pub fn campaign(&self) -> &Campaign {
        self.campaign.campaign()
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn alt_body(&self) -> &[u8] {
        &self.alt_body
    }

    pub fn unsubscribe_url(&self) -> &str {
        &self.unsubscribe_url
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }
}
