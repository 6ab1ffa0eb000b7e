use std::env;
use std::time::Duration;
use tracing::warn;

use crate::lot::{LotPolicy, ValidationMode};

pub const DEFAULT_TARGET_URL: &str =
    "https://www.duksan.co.kr/product/coa_result.php?lot_no={lot_no}";
pub const DEFAULT_FORM_URL: &str = "https://www.duksan.co.kr/product/coa_result.php";

/// Phrases shown on anti-bot interstitials, matched against visible text.
const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "checking your browser",
    "verify you are human",
    "access denied",
];

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Direct GET template; `{lot_no}` is replaced with the percent-encoded lot.
    pub target_url: String,
    pub form_url: Option<String>,
    pub search_page_url: Option<String>,
    /// CORS proxy template; `{url}` is replaced with the encoded target URL.
    pub proxy_url: Option<String>,
    pub timeout: Duration,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    pub lot_policy: LotPolicy,
    pub block_markers: Vec<String>,
    pub expected_marker: Option<String>,
    pub enable_fallback_data: bool,
    pub cache_max_age_secs: u64,
    pub production: bool,
    pub outbound_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            target_url: DEFAULT_TARGET_URL.to_string(),
            form_url: Some(DEFAULT_FORM_URL.to_string()),
            search_page_url: None,
            proxy_url: None,
            timeout: Duration::from_secs(15),
            fetch_retries: 1,
            retry_backoff: Duration::from_millis(300),
            lot_policy: LotPolicy::default(),
            block_markers: DEFAULT_BLOCK_MARKERS.iter().map(|s| s.to_string()).collect(),
            expected_marker: None,
            enable_fallback_data: false,
            cache_max_age_secs: 300,
            production: true,
            outbound_limit: 16,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't have to touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let timeout = match parse_or::<u64>(&get, "COA_TIMEOUT_MS", 0) {
            0 => Duration::from_secs(parse_or(&get, "COA_TIMEOUT_SECS", 15u64).clamp(1, 60)),
            ms => Duration::from_millis(ms),
        };

        let mode = match get("COA_LOT_VALIDATION").as_deref() {
            None | Some("") | Some("strict") => ValidationMode::Strict,
            Some("lenient") => ValidationMode::Lenient,
            Some(other) => {
                warn!("Unknown COA_LOT_VALIDATION '{}', using strict", other);
                ValidationMode::Strict
            }
        };

        let block_markers = match get("COA_BLOCK_MARKERS") {
            Some(list) => list
                .split(',')
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            None => defaults.block_markers.clone(),
        };

        let environment = get("COA_ENV")
            .or_else(|| get("APP_ENV"))
            .unwrap_or_else(|| "production".to_string());

        Self {
            bind_addr: get("COA_BIND_ADDR")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.bind_addr),
            target_url: get("COA_TARGET_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.target_url),
            // An explicitly empty COA_FORM_URL switches the form strategy off
            form_url: match get("COA_FORM_URL") {
                Some(v) if v.is_empty() => None,
                Some(v) => Some(v),
                None => defaults.form_url,
            },
            search_page_url: get("COA_SEARCH_PAGE_URL").filter(|v| !v.is_empty()),
            proxy_url: get("COA_PROXY_URL").filter(|v| !v.is_empty()),
            timeout,
            fetch_retries: parse_or(&get, "COA_FETCH_RETRIES", defaults.fetch_retries).min(5),
            retry_backoff: Duration::from_millis(parse_or(&get, "COA_RETRY_BACKOFF_MS", 300u64)),
            lot_policy: LotPolicy {
                mode,
                max_len: parse_or(&get, "COA_LOT_MAX_LEN", defaults.lot_policy.max_len).max(1),
            },
            block_markers,
            expected_marker: get("COA_EXPECTED_MARKER").filter(|v| !v.is_empty()),
            enable_fallback_data: parse_bool(get("COA_ENABLE_FALLBACK_DATA")),
            cache_max_age_secs: parse_or(&get, "COA_CACHE_MAX_AGE_SECS", defaults.cache_max_age_secs),
            production: environment.eq_ignore_ascii_case("production")
                || environment.eq_ignore_ascii_case("prod"),
            outbound_limit: parse_or(&get, "COA_OUTBOUND_LIMIT", defaults.outbound_limit).max(1),
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match get(key) {
        None => default,
        Some(raw) if raw.is_empty() => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using default", raw, key);
            default
        }),
    }
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.target_url, DEFAULT_TARGET_URL);
        assert_eq!(config.form_url.as_deref(), Some(DEFAULT_FORM_URL));
        assert!(config.proxy_url.is_none());
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.lot_policy.mode, ValidationMode::Strict);
        assert!(config.production);
        assert!(!config.enable_fallback_data);
    }

    #[test]
    fn test_overrides_and_clamping() {
        let config = config_from(&[
            ("COA_TIMEOUT_SECS", "600"),
            ("COA_FORM_URL", ""),
            ("COA_PROXY_URL", "https://proxy.example/raw?url={url}"),
            ("COA_LOT_VALIDATION", "lenient"),
            ("COA_ENABLE_FALLBACK_DATA", "true"),
            ("COA_ENV", "development"),
            ("COA_BLOCK_MARKERS", " Robot Check , ,captcha"),
        ]);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.form_url.is_none());
        assert_eq!(config.proxy_url.as_deref(), Some("https://proxy.example/raw?url={url}"));
        assert_eq!(config.lot_policy.mode, ValidationMode::Lenient);
        assert!(config.enable_fallback_data);
        assert!(!config.production);
        assert_eq!(config.block_markers, vec!["robot check", "captcha"]);
    }

    #[test]
    fn test_timeout_ms_wins_and_bad_numbers_fall_back() {
        let config = config_from(&[
            ("COA_TIMEOUT_MS", "250"),
            ("COA_TIMEOUT_SECS", "5"),
            ("COA_FETCH_RETRIES", "many"),
        ]);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.fetch_retries, 1);
    }
}
