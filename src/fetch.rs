use anyhow::{anyhow, bail};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use scraper::Html;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::extract::page_lines;
use crate::lot::LotQuery;

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";

pub const LOT_PLACEHOLDER: &str = "{lot_no}";
pub const URL_PLACEHOLDER: &str = "{url}";

/// Raw markup retrieved for one lot. Lives for a single request.
#[derive(Debug, Clone)]
pub struct CertificateDocument {
    pub lot: String,
    pub url: String,
    pub strategy: &'static str,
    pub status: u16,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },
    #[error("Could not reach {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("No certificate found for lot {lot}")]
    NotFound { lot: String },
    #[error("Request to {url} was blocked: {reason}")]
    Blocked { url: String, reason: String },
    #[error("{url} answered with HTTP {status}")]
    UpstreamStatus { url: String, status: u16 },
    #[error("Failed to read response from {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("Invalid fetch configuration: {0}")]
    Config(String),
}

impl FetchError {
    /// Worth retrying the same strategy after a short pause.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Unreachable { .. } => true,
            FetchError::UpstreamStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Worth handing over to the next strategy in the chain.
    pub fn should_fall_back(&self) -> bool {
        match self {
            FetchError::Timeout { .. }
            | FetchError::Unreachable { .. }
            | FetchError::Blocked { .. }
            | FetchError::NotFound { .. } => true,
            FetchError::UpstreamStatus { status, .. } => *status >= 500,
            FetchError::Body { .. } | FetchError::Config(_) => false,
        }
    }

    fn from_transport(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Unreachable {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Recognises anti-bot interstitials served with a 2xx status.
#[derive(Debug, Clone, Default)]
pub struct BlockDetector {
    markers: Vec<String>,
    expected_marker: Option<String>,
}

impl BlockDetector {
    pub fn new(markers: Vec<String>, expected_marker: Option<String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
            expected_marker,
        }
    }

    /// Block markers are looked for in the visible page text only, so a
    /// vendor page that merely loads a captcha script is not a block. The
    /// expected marker is matched against the raw markup.
    pub fn check(&self, url: &str, body: &str) -> Result<(), FetchError> {
        let visible = if self.markers.is_empty() {
            String::new()
        } else {
            page_lines(&Html::parse_document(body)).join("\n").to_lowercase()
        };
        if let Some(marker) = self.markers.iter().find(|m| visible.contains(m.as_str())) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: format!("page contains '{}'", marker),
            });
        }
        if let Some(expected) = &self.expected_marker {
            if !body.contains(expected.as_str()) {
                return Err(FetchError::Blocked {
                    url: url.to_string(),
                    reason: format!("expected element '{}' missing", expected),
                });
            }
        }
        Ok(())
    }
}

/// Shared knobs every strategy needs.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub detector: BlockDetector,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, lot: &LotQuery) -> Result<CertificateDocument, FetchError>;
}

fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
}

/// Substitutes the percent-encoded lot into a URL template.
pub fn render_target(template: &str, lot: &LotQuery) -> Result<String, FetchError> {
    let encoded = utf8_percent_encode(lot.as_str(), NON_ALPHANUMERIC).to_string();
    let url = template.replace(LOT_PLACEHOLDER, &encoded);
    Url::parse(&url).map_err(|e| FetchError::Config(format!("invalid URL '{}': {}", url, e)))?;
    Ok(url)
}

fn browser_request(builder: reqwest::RequestBuilder, timeout: Duration) -> reqwest::RequestBuilder {
    builder
        .timeout(timeout)
        .header("User-Agent", random_user_agent())
        .header("Accept", ACCEPT_HTML)
        .header("Accept-Language", ACCEPT_LANGUAGE)
        .header("DNT", "1")
        .header("Upgrade-Insecure-Requests", "1")
}

fn check_status(status: StatusCode, url: &str, lot: &LotQuery) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::NOT_FOUND => FetchError::NotFound {
            lot: lot.to_string(),
        },
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => FetchError::Blocked {
            url: url.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        },
        other => FetchError::UpstreamStatus {
            url: url.to_string(),
            status: other.as_u16(),
        },
    })
}

async fn read_body(response: Response, url: &str) -> Result<String, FetchError> {
    response.text().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Body {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })
}

async fn into_document(
    response: Response,
    lot: &LotQuery,
    url: &str,
    strategy: &'static str,
    settings: &FetchSettings,
) -> Result<CertificateDocument, FetchError> {
    let status = response.status();
    check_status(status, url, lot)?;
    let html = read_body(response, url).await?;
    settings.detector.check(url, &html)?;
    Ok(CertificateDocument {
        lot: lot.to_string(),
        url: url.to_string(),
        strategy,
        status: status.as_u16(),
        html,
    })
}

/// Plain GET on the templated vendor URL.
pub struct DirectGet {
    client: Client,
    url_template: String,
    settings: FetchSettings,
}

impl DirectGet {
    pub fn new(client: Client, url_template: impl Into<String>, settings: FetchSettings) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            settings,
        }
    }
}

#[async_trait]
impl FetchStrategy for DirectGet {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn fetch(&self, lot: &LotQuery) -> Result<CertificateDocument, FetchError> {
        let url = render_target(&self.url_template, lot)?;
        debug!("GET {}", url);
        let response = browser_request(self.client.get(&url), self.settings.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(&url, e))?;
        into_document(response, lot, &url, self.name(), &self.settings).await
    }
}

/// Submits the vendor's lot search form, optionally after loading the search
/// page so that session cookies travel with the POST.
pub struct FormPost {
    client: Client,
    form_url: String,
    search_page_url: Option<String>,
    settings: FetchSettings,
}

impl FormPost {
    pub fn new(
        client: Client,
        form_url: impl Into<String>,
        search_page_url: Option<String>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            client,
            form_url: form_url.into(),
            search_page_url,
            settings,
        }
    }

    /// Loads the search page and returns a `Cookie` header value built from
    /// its `Set-Cookie` headers. The cookies live only for this request.
    async fn session_cookies(&self, page_url: &str) -> Result<Option<String>, FetchError> {
        let response = browser_request(self.client.get(page_url), self.settings.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(page_url, e))?;
        if !response.status().is_success() {
            warn!("Search page {} answered HTTP {}", page_url, response.status());
            return Ok(None);
        }
        let cookies: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(|pair| pair.trim().to_string())
            .filter(|pair| pair.contains('='))
            .collect();
        Ok((!cookies.is_empty()).then(|| cookies.join("; ")))
    }
}

#[async_trait]
impl FetchStrategy for FormPost {
    fn name(&self) -> &'static str {
        "form"
    }

    async fn fetch(&self, lot: &LotQuery) -> Result<CertificateDocument, FetchError> {
        let cookies = match &self.search_page_url {
            Some(page_url) => self.session_cookies(page_url).await?,
            None => None,
        };

        debug!("POST {} (lot_no={})", self.form_url, lot);
        let mut request = browser_request(self.client.post(&self.form_url), self.settings.timeout)
            .form(&[("lot_no", lot.as_str())]);
        if let Some(page_url) = &self.search_page_url {
            request = request.header("Referer", page_url.as_str());
        }
        if let Some(cookies) = cookies {
            request = request.header("Cookie", cookies);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_transport(&self.form_url, e))?;
        into_document(response, lot, &self.form_url, self.name(), &self.settings).await
    }
}

#[derive(Debug, Deserialize)]
struct ProxyEnvelope {
    contents: Option<String>,
    #[serde(default)]
    status: Option<ProxyStatus>,
}

#[derive(Debug, Deserialize)]
struct ProxyStatus {
    #[serde(default)]
    http_code: Option<u16>,
}

/// Fetches the vendor page through a public CORS proxy. Both raw-body proxies
/// and JSON proxies that wrap the page in `contents` are understood.
pub struct CorsProxy {
    client: Client,
    proxy_template: String,
    target_template: String,
    settings: FetchSettings,
}

impl CorsProxy {
    pub fn new(
        client: Client,
        proxy_template: impl Into<String>,
        target_template: impl Into<String>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            client,
            proxy_template: proxy_template.into(),
            target_template: target_template.into(),
            settings,
        }
    }
}

#[async_trait]
impl FetchStrategy for CorsProxy {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn fetch(&self, lot: &LotQuery) -> Result<CertificateDocument, FetchError> {
        let target = render_target(&self.target_template, lot)?;
        let encoded = utf8_percent_encode(&target, NON_ALPHANUMERIC).to_string();
        let proxy_url = self.proxy_template.replace(URL_PLACEHOLDER, &encoded);
        debug!("GET {} via proxy", target);

        let response = browser_request(self.client.get(&proxy_url), self.settings.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(&proxy_url, e))?;
        let status = response.status();
        check_status(status, &target, lot)?;
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let body = read_body(response, &proxy_url).await?;

        let html = if is_json {
            let envelope: ProxyEnvelope = serde_json::from_str(&body).map_err(|e| FetchError::Body {
                url: proxy_url.clone(),
                reason: format!("unexpected proxy payload: {}", e),
            })?;
            if let Some(code) = envelope.status.and_then(|s| s.http_code) {
                let code = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                check_status(code, &target, lot)?;
            }
            envelope.contents.unwrap_or_default()
        } else {
            body
        };

        self.settings.detector.check(&target, &html)?;
        Ok(CertificateDocument {
            lot: lot.to_string(),
            url: target,
            strategy: self.name(),
            status: status.as_u16(),
            html,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently or runs out of attempts,
/// sleeping a fixed delay between attempts.
pub async fn with_retries<F, Fut>(
    policy: RetryPolicy,
    strategy: &str,
    mut op: F,
) -> Result<CertificateDocument, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CertificateDocument, FetchError>>,
{
    let max_attempts = policy.retries + 1;
    let mut attempt = 0u32;
    let fixed = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.delay)
        .with_max_interval(policy.delay)
        .with_multiplier(1.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    retry(fixed, || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            fut.await.map_err(|err| {
                if err.is_transient() && current < max_attempts {
                    warn!(
                        "Strategy '{}' attempt {}/{} failed: {}. Retrying",
                        strategy, current, max_attempts, err
                    );
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    })
    .await
}

/// Ordered fetch strategies, tried one after another until one succeeds.
pub struct StrategyChain {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    retry: RetryPolicy,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>, retry: RetryPolicy) -> Self {
        Self { strategies, retry }
    }

    /// Direct GET first, then the form POST and finally the proxy, each only
    /// when configured.
    pub fn from_config(config: &Config, client: Client) -> anyhow::Result<Self> {
        if !config.target_url.contains(LOT_PLACEHOLDER) {
            bail!("COA_TARGET_URL must contain {}", LOT_PLACEHOLDER);
        }
        let settings = FetchSettings {
            timeout: config.timeout,
            detector: BlockDetector::new(
                config.block_markers.clone(),
                config.expected_marker.clone(),
            ),
        };

        let mut strategies: Vec<Arc<dyn FetchStrategy>> = vec![Arc::new(DirectGet::new(
            client.clone(),
            config.target_url.clone(),
            settings.clone(),
        ))];

        if let Some(form_url) = &config.form_url {
            Url::parse(form_url).map_err(|e| anyhow!("Invalid COA_FORM_URL '{}': {}", form_url, e))?;
            strategies.push(Arc::new(FormPost::new(
                client.clone(),
                form_url.clone(),
                config.search_page_url.clone(),
                settings.clone(),
            )));
        }

        if let Some(proxy_url) = &config.proxy_url {
            if !proxy_url.contains(URL_PLACEHOLDER) {
                bail!("COA_PROXY_URL must contain {}", URL_PLACEHOLDER);
            }
            strategies.push(Arc::new(CorsProxy::new(
                client,
                proxy_url.clone(),
                config.target_url.clone(),
                settings,
            )));
        }

        Ok(Self::new(
            strategies,
            RetryPolicy {
                retries: config.fetch_retries,
                delay: config.retry_backoff,
            },
        ))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Returns the first document obtained. When every strategy fails, the
    /// primary strategy's error is reported.
    pub async fn fetch(&self, lot: &LotQuery) -> Result<CertificateDocument, FetchError> {
        self.fetch_from(0, lot).await.map(|(_, document)| document)
    }

    /// Like `fetch`, but starts at strategy `start` and also returns the index
    /// of the strategy that produced the document, so a caller that rejects
    /// the document can resume with the next one.
    pub async fn fetch_from(
        &self,
        start: usize,
        lot: &LotQuery,
    ) -> Result<(usize, CertificateDocument), FetchError> {
        let mut first_error: Option<FetchError> = None;

        for (index, strategy) in self.strategies.iter().enumerate().skip(start) {
            let name = strategy.name();
            match with_retries(self.retry, name, || strategy.fetch(lot)).await {
                Ok(document) => {
                    info!(
                        "Fetched certificate for lot {} via '{}' ({} bytes)",
                        lot,
                        name,
                        document.html.len()
                    );
                    return Ok((index, document));
                }
                Err(err) => {
                    let fall_back = err.should_fall_back();
                    warn!("Fetch strategy '{}' failed for lot {}: {}", name, lot, err);
                    first_error.get_or_insert(err);
                    if !fall_back {
                        break;
                    }
                }
            }
        }

        Err(first_error
            .unwrap_or_else(|| FetchError::Config("no fetch strategies configured".to_string())))
    }
}
