use crate::links::LinkTracker;
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use dispatch_core::config::{fill_url, UrlTemplates};
use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind, State};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_DATE_LAYOUT: &str = "%a %b %e %H:%M:%S %Y";

/// Registers the functions available to every template.
pub(crate) fn add_generic_functions(env: &mut Environment<'static>) {
    env.add_function("Date", date);
    env.add_function("Safe", safe);
}

fn date(layout: Option<String>) -> Result<String, Error> {
    let layout = layout
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_DATE_LAYOUT.to_string());

    let items: Vec<Item<'_>> = StrftimeItems::new(&layout).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid date layout {layout:?}"),
        ));
    }
    Ok(Local::now().format_with_items(items.into_iter()).to_string())
}

fn safe(html: String) -> Value {
    Value::from_safe_string(html)
}

/// Per-campaign state the campaign functions close over.
#[derive(Clone)]
pub(crate) struct CampaignFuncs {
    pub(crate) links: Arc<LinkTracker>,
    pub(crate) urls: UrlTemplates,
    pub(crate) campaign_uuid: String,
    pub(crate) individual_tracking: bool,
}

/// Registers `TrackLink`, `TrackView`, `UnsubscribeURL`, `ManageURL`,
/// `OptinURL`, `MessageURL` and `ArchiveURL`. They read the subscriber from
/// the render context.
pub(crate) fn add_campaign_functions(env: &mut Environment<'static>, funcs: CampaignFuncs) {
    let f = funcs.clone();
    env.add_function(
        "TrackLink",
        move |state: &State, url: String| -> Result<Value, Error> {
            let sub = tracking_uuid(state, f.individual_tracking)?;
            Ok(Value::from_safe_string(f.links.track(&url, &f.campaign_uuid, &sub)))
        },
    );

    let f = funcs.clone();
    env.add_function("TrackView", move |state: &State| -> Result<Value, Error> {
        let sub = tracking_uuid(state, f.individual_tracking)?;
        let url = fill_url(&f.urls.view_track, &[&f.campaign_uuid, &sub]);
        Ok(Value::from_safe_string(format!(
            r#"<img src="{url}" alt="" />"#
        )))
    });

    let f = funcs.clone();
    env.add_function("UnsubscribeURL", move |state: &State| -> Result<Value, Error> {
        let sub = subscriber_uuid(state)?;
        Ok(url_value(fill_url(&f.urls.unsubscribe, &[&f.campaign_uuid, &sub])))
    });

    let f = funcs.clone();
    env.add_function("ManageURL", move |state: &State| -> Result<Value, Error> {
        let sub = subscriber_uuid(state)?;
        let url = fill_url(&f.urls.unsubscribe, &[&f.campaign_uuid, &sub]);
        Ok(url_value(format!("{url}?manage=true")))
    });

    let f = funcs.clone();
    env.add_function("OptinURL", move |state: &State| -> Result<Value, Error> {
        let sub = subscriber_uuid(state)?;
        Ok(url_value(fill_url(&f.urls.optin, &[&sub, ""])))
    });

    let f = funcs.clone();
    env.add_function("MessageURL", move |state: &State| -> Result<Value, Error> {
        let sub = subscriber_uuid(state)?;
        Ok(url_value(fill_url(&f.urls.message, &[&f.campaign_uuid, &sub])))
    });

    let archive = funcs.urls.archive;
    env.add_function("ArchiveURL", move || url_value(archive.clone()));
}

/// Generated URLs are trusted and must survive HTML auto-escaping intact.
fn url_value(url: String) -> Value {
    Value::from_safe_string(url)
}

fn subscriber_uuid(state: &State) -> Result<String, Error> {
    state
        .lookup("Subscriber")
        .and_then(|sub| sub.get_attr("uuid").ok())
        .and_then(|uuid| uuid.as_str().map(str::to_string))
        .ok_or_else(|| Error::new(ErrorKind::UndefinedError, "no subscriber in render context"))
}

/// Subscriber UUID for tracking URLs, or the nil UUID when individual
/// tracking is off.
fn tracking_uuid(state: &State, individual: bool) -> Result<String, Error> {
    if individual {
        subscriber_uuid(state)
    } else {
        Ok(Uuid::nil().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::MemoryStore;
    use serde_json::json;

    fn env_with_campaign_funcs(individual_tracking: bool) -> Environment<'static> {
        let urls = UrlTemplates::from_root("https://lists.example.com");
        let mut env = Environment::new();
        add_generic_functions(&mut env);
        add_campaign_functions(
            &mut env,
            CampaignFuncs {
                links: Arc::new(LinkTracker::new(
                    Arc::new(MemoryStore::new()),
                    urls.link_track.clone(),
                )),
                urls,
                campaign_uuid: "camp-uuid".to_string(),
                individual_tracking,
            },
        );
        env
    }

    fn render(env: &Environment<'static>, source: &str) -> Result<String, Error> {
        env.render_str(source, json!({"Subscriber": {"uuid": "sub-uuid"}}))
    }

    #[test]
    fn test_date_default_layout() {
        let out = date(None).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn test_date_rejects_invalid_layout() {
        assert!(date(Some("%Q".to_string())).is_err());
    }

    #[test]
    fn test_safe_is_not_escaped() {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::Html);
        add_generic_functions(&mut env);
        let out = env
            .render_str("{{ Safe(\"<b>hi</b>\") }} {{ \"<i>\" }}", ())
            .unwrap();
        assert_eq!(out, "<b>hi</b> &lt;i&gt;");
    }

    #[test]
    fn test_subscription_urls() {
        let env = env_with_campaign_funcs(false);
        assert_eq!(
            render(&env, "{{ UnsubscribeURL() }}").unwrap(),
            "https://lists.example.com/subscription/camp-uuid/sub-uuid"
        );
        assert_eq!(
            render(&env, "{{ ManageURL() }}").unwrap(),
            "https://lists.example.com/subscription/camp-uuid/sub-uuid?manage=true"
        );
        assert_eq!(
            render(&env, "{{ OptinURL() }}").unwrap(),
            "https://lists.example.com/subscription/optin/sub-uuid?"
        );
        assert_eq!(
            render(&env, "{{ MessageURL() }}").unwrap(),
            "https://lists.example.com/campaign/camp-uuid/sub-uuid"
        );
        assert_eq!(
            render(&env, "{{ ArchiveURL() }}").unwrap(),
            "https://lists.example.com/archive"
        );
    }

    #[test]
    fn test_track_view_uses_nil_uuid_without_individual_tracking() {
        let env = env_with_campaign_funcs(false);
        let out = render(&env, "{{ TrackView() }}").unwrap();
        assert_eq!(
            out,
            format!(
                r#"<img src="https://lists.example.com/campaign/camp-uuid/{}/px.png" alt="" />"#,
                Uuid::nil()
            )
        );
    }

    #[test]
    fn test_track_view_uses_subscriber_with_individual_tracking() {
        let env = env_with_campaign_funcs(true);
        let out = render(&env, "{{ TrackView() }}").unwrap();
        assert!(out.contains("/campaign/camp-uuid/sub-uuid/px.png"));
    }

    #[test]
    fn test_subscriber_functions_need_a_subscriber() {
        let env = env_with_campaign_funcs(true);
        assert!(env.render_str("{{ UnsubscribeURL() }}", ()).is_err());
    }
}
