use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "DISPATCH_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: String, value: String },
}

/// URL templates with positional `%s` placeholders.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UrlTemplates {
    pub root: String,
    /// campaign UUID, subscriber UUID
    pub unsubscribe: String,
    /// subscriber UUID, list query
    pub optin: String,
    /// link UUID, campaign UUID, subscriber UUID
    pub link_track: String,
    /// campaign UUID, subscriber UUID
    pub view_track: String,
    /// campaign UUID, subscriber UUID
    pub message: String,
    pub archive: String,
}

impl UrlTemplates {
    pub fn from_root(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            root: root.to_string(),
            unsubscribe: format!("{root}/subscription/%s/%s"),
            optin: format!("{root}/subscription/optin/%s?%s"),
            link_track: format!("{root}/link/%s/%s/%s"),
            view_track: format!("{root}/campaign/%s/%s/px.png"),
            message: format!("{root}/campaign/%s/%s"),
            archive: format!("{root}/archive"),
        }
    }
}

impl Default for UrlTemplates {
    fn default() -> Self {
        Self::from_root("http://localhost:9000")
    }
}

/// Substitutes `args` into the `%s` placeholders of `template`, left to right.
/// Surplus placeholders are left as-is.
pub fn fill_url(template: &str, args: &[&str]) -> String {
    let extra: usize = args.iter().map(|a| a.len()).sum();
    let mut out = String::with_capacity(template.len() + extra);
    let mut rest = template;
    let mut args = args.iter();

    while let Some(pos) = rest.find("%s") {
        match args.next() {
            Some(arg) => {
                out.push_str(&rest[..pos]);
                out.push_str(arg);
                rest = &rest[pos + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub batch_size: usize,
    pub concurrency: usize,
    pub message_rate: usize,
    /// 0 disables auto-pausing.
    pub max_send_errors: u64,
    pub sliding_window: bool,
    pub sliding_window_rate: usize,
    pub sliding_window_duration: Duration,
    pub from_email: String,
    pub individual_tracking: bool,
    pub urls: UrlTemplates,
    pub unsub_header: bool,
    pub scan_interval: Duration,
    pub scan_campaigns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 10,
            message_rate: 10,
            max_send_errors: 1000,
            sliding_window: false,
            sliding_window_rate: 10000,
            sliding_window_duration: Duration::from_secs(3600),
            from_email: "noreply@localhost".to_string(),
            individual_tracking: false,
            urls: UrlTemplates::default(),
            unsub_header: true,
            scan_interval: Duration::from_secs(5),
            scan_campaigns: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let root = lookup("ROOT_URL").unwrap_or_else(|| defaults.urls.root.clone());
        let mut urls = UrlTemplates::from_root(&root);
        if let Some(v) = lookup("UNSUB_URL") {
            urls.unsubscribe = v;
        }
        if let Some(v) = lookup("OPTIN_URL") {
            urls.optin = v;
        }
        if let Some(v) = lookup("LINK_TRACK_URL") {
            urls.link_track = v;
        }
        if let Some(v) = lookup("VIEW_TRACK_URL") {
            urls.view_track = v;
        }
        if let Some(v) = lookup("MESSAGE_URL") {
            urls.message = v;
        }
        if let Some(v) = lookup("ARCHIVE_URL") {
            urls.archive = v;
        }

        let config = Config {
            batch_size: parse(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            concurrency: parse(&lookup, "CONCURRENCY", defaults.concurrency)?,
            message_rate: parse(&lookup, "MESSAGE_RATE", defaults.message_rate)?,
            max_send_errors: parse(&lookup, "MAX_SEND_ERRORS", defaults.max_send_errors)?,
            sliding_window: parse_bool(&lookup, "SLIDING_WINDOW", defaults.sliding_window)?,
            sliding_window_rate: parse(
                &lookup,
                "SLIDING_WINDOW_RATE",
                defaults.sliding_window_rate,
            )?,
            sliding_window_duration: Duration::from_secs(parse(
                &lookup,
                "SLIDING_WINDOW_DURATION_SECS",
                defaults.sliding_window_duration.as_secs(),
            )?),
            from_email: lookup("FROM_EMAIL").unwrap_or(defaults.from_email),
            individual_tracking: parse_bool(
                &lookup,
                "INDIVIDUAL_TRACKING",
                defaults.individual_tracking,
            )?,
            urls,
            unsub_header: parse_bool(&lookup, "UNSUB_HEADER", defaults.unsub_header)?,
            scan_interval: Duration::from_secs(parse(
                &lookup,
                "SCAN_INTERVAL_SECS",
                defaults.scan_interval.as_secs(),
            )?),
            scan_campaigns: parse_bool(&lookup, "SCAN_CAMPAIGNS", defaults.scan_campaigns)?,
        };

        Ok(config.normalized())
    }

    /// Clamps values the engine cannot run with.
    pub fn normalized(mut self) -> Self {
        if self.batch_size < 1 {
            self.batch_size = 1000;
        }
        if self.concurrency < 1 {
            self.concurrency = 1;
        }
        if self.message_rate < 1 {
            self.message_rate = 1;
        }
        if self.scan_interval.is_zero() {
            self.scan_interval = Duration::from_secs(1);
        }
        self
    }
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: format!("{ENV_PREFIX}{name}"),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name: format!("{ENV_PREFIX}{name}"),
                value,
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.message_rate, 10);
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert!(config.scan_campaigns);
        assert!(config.unsub_header);
        assert!(!config.sliding_window);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("BATCH_SIZE", "250"),
            ("CONCURRENCY", "4"),
            ("SLIDING_WINDOW", "true"),
            ("SLIDING_WINDOW_RATE", "50"),
            ("SLIDING_WINDOW_DURATION_SECS", "60"),
            ("SCAN_CAMPAIGNS", "0"),
            ("ROOT_URL", "https://lists.example.com/"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.concurrency, 4);
        assert!(config.sliding_window);
        assert_eq!(config.sliding_window_rate, 50);
        assert_eq!(config.sliding_window_duration, Duration::from_secs(60));
        assert!(!config.scan_campaigns);
        assert_eq!(
            config.urls.unsubscribe,
            "https://lists.example.com/subscription/%s/%s"
        );
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[("BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("DISPATCH_BATCH_SIZE"));
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("UNSUB_HEADER", "maybe")])).is_err());
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config = Config::from_lookup(lookup_from(&[
            ("BATCH_SIZE", "0"),
            ("CONCURRENCY", "0"),
            ("MESSAGE_RATE", "0"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.message_rate, 1);
    }

    #[test]
    fn test_explicit_url_template_wins_over_root() {
        let config = Config::from_lookup(lookup_from(&[
            ("ROOT_URL", "https://a.example"),
            ("ARCHIVE_URL", "https://b.example/past"),
        ]))
        .unwrap();
        assert_eq!(config.urls.archive, "https://b.example/past");
        assert_eq!(config.urls.message, "https://a.example/campaign/%s/%s");
    }

    #[test]
    fn test_fill_url_substitutes_in_order() {
        assert_eq!(
            fill_url("https://x/link/%s/%s/%s", &["l", "c", "s"]),
            "https://x/link/l/c/s"
        );
    }

    #[test]
    fn test_fill_url_leaves_surplus_placeholders() {
        assert_eq!(fill_url("https://x/%s/%s", &["a"]), "https://x/a/%s");
        assert_eq!(fill_url("https://x/archive", &["a"]), "https://x/archive");
    }
}
