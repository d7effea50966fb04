//! Link previews for citation sources.
//!
//! Clients send the URLs of the sources a model cited; each page is fetched
//! once and its title, description and preview image are pulled from the
//! `<meta>` tags. Literal targets are checked before every request and
//! every redirect hop, and host names go through [`GuardedResolver`], so no
//! connection reaches a loopback or private network address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use futures::StreamExt;
use regex::Regex;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::{with_retry, ChatError, ChatResult, RetryPolicy};

pub const MAX_BATCH_URLS: usize = 10;
pub const MAX_URL_LEN: usize = 2048;

/// URLs fetched concurrently; further URLs wait for the previous group.
const CONCURRENT_FETCHES: usize = 5;
const GROUP_PAUSE: Duration = Duration::from_millis(100);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MIN_HTML_BYTES: usize = 100;
const MAX_TEXT_CHARS: usize = 500;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; MetadataBot/1.0)";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Plain HTTP targets; HTTPS is always allowed.
    pub allow_http: bool,
    /// Loopback, private and link-local targets.
    pub allow_private_network: bool,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            allow_http: false,
            allow_private_network: false,
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlRejection {
    #[error("invalid URL: {0}")]
    Invalid(String),
    #[error("unsupported protocol {0}")]
    UnsupportedScheme(String),
    #[error("URLs with credentials not allowed")]
    Credentials,
    #[error("URL too long")]
    TooLong,
    #[error("blocked host {0}")]
    BlockedHost(String),
    #[error("private address {0}")]
    PrivateAddress(IpAddr),
    #[error("host {0} resolves only to private addresses")]
    PrivateResolution(String),
}

/// Parse `raw` and check it against `policy` without touching the network.
pub fn validate_url(raw: &str, policy: &FetchPolicy) -> Result<Url, UrlRejection> {
    if raw.len() > MAX_URL_LEN {
        return Err(UrlRejection::TooLong);
    }
    let url = Url::parse(raw).map_err(|err| UrlRejection::Invalid(err.to_string()))?;
    check_url(&url, policy)?;
    Ok(url)
}

fn check_url(url: &Url, policy: &FetchPolicy) -> Result<(), UrlRejection> {
    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        scheme => return Err(UrlRejection::UnsupportedScheme(scheme.to_string())),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlRejection::Credentials);
    }
    if policy.allow_private_network {
        return Ok(());
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") || !domain.contains('.') {
                return Err(UrlRejection::BlockedHost(domain));
            }
            Ok(())
        }
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
        None => Err(UrlRejection::Invalid("missing host".to_string())),
    }
}

fn check_ip(ip: IpAddr) -> Result<(), UrlRejection> {
    if is_private_ip(ip) {
        Err(UrlRejection::PrivateAddress(ip))
    } else {
        Ok(())
    }
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_private_v4(ip),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_private_v4(mapped);
            }
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || (a == 100 && (64..128).contains(&b)) // carrier-grade NAT
}

/// Credentials and fragment removed.
pub fn sanitize_url(url: &Url) -> Url {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);
    url
}

pub fn favicon_url(url: &str) -> String {
    match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        Some(host) => format!("https://www.google.com/s2/favicons?domain={host}&sz=32"),
        None => "https://www.google.com/favicon.ico".to_string(),
    }
}

fn default_title(url: &Url) -> String {
    url.host_str()
        .map(|host| host.trim_start_matches("www.").to_string())
        .unwrap_or_else(|| "Unknown website".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMetadata {
    pub url: String,
    pub title: String,
    pub description: String,
    pub favicon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub final_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: FetchStatus,
}

impl LinkMetadata {
    fn failed(url: &str, title: &str, description: &str, error: String) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            favicon: favicon_url(url),
            image: None,
            final_url: url.to_string(),
            error: Some(error),
            status: FetchStatus::Error,
        }
    }
}

/// Fields read from a page, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
}

/// Regex-based reader for the `<head>` fields link previews need.
pub struct PageScanner {
    meta_tag: Regex,
    attribute: Regex,
    title: Regex,
}

impl PageScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            meta_tag: Regex::new(r"(?is)<meta\b[^>]*>")?,
            attribute: Regex::new(
                r#"(?is)([a-z][a-z0-9_:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
            )?,
            title: Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>")?,
        })
    }

    pub fn scan(&self, html: &str, base: &Url) -> PageMetadata {
        let mut meta = std::collections::HashMap::new();
        for tag in self.meta_tag.find_iter(html) {
            let mut key = None;
            let mut content = None;
            for attr in self.attribute.captures_iter(tag.as_str()) {
                let value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .or_else(|| attr.get(4))
                    .map_or("", |m| m.as_str());
                match attr[1].to_ascii_lowercase().as_str() {
                    "property" | "name" => key = Some(value.to_ascii_lowercase()),
                    "content" => content = Some(decode_entities(value)),
                    _ => {}
                }
            }
            if let (Some(key), Some(content)) = (key, content) {
                meta.entry(key).or_insert(content);
            }
        }

        let pick = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| meta.get(*key))
                .map(|value| clean_text(value))
                .find(|value| !value.is_empty())
        };

        let title = pick(&["og:title", "twitter:title"]).or_else(|| {
            self.title
                .captures(html)
                .map(|caps| clean_text(&decode_entities(&caps[1])))
                .filter(|title| !title.is_empty())
        });

        PageMetadata {
            title,
            description: pick(&["og:description", "twitter:description", "description"]),
            image: pick(&["og:image", "og:image:url", "twitter:image"])
                .and_then(|image| resolve_image(base, &image)),
        }
    }
}

fn resolve_image(base: &Url, image: &str) -> Option<String> {
    let url = base.join(image).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Whitespace runs collapsed, trimmed, at most 500 characters.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_TEXT_CHARS)
        .collect()
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Short message for the client; the full error goes to the logs.
fn describe_failure(err: &anyhow::Error) -> &'static str {
    // Guard rejections surface wrapped in connect or redirect errors.
    if err
        .chain()
        .any(|cause| cause.downcast_ref::<UrlRejection>().is_some())
    {
        return "URL failed validation";
    }
    if let Some(err) = err.downcast_ref::<reqwest::Error>() {
        if err.is_timeout() {
            return "Request timed out";
        }
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 | 403 => "Access denied",
                404 => "Page not found",
                500..=599 => "Server error",
                _ => "Failed to fetch metadata",
            };
        }
        if err.is_connect() {
            return "Website not found";
        }
    }
    "Failed to fetch metadata"
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

pub struct MetadataFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    retry: RetryPolicy,
    scanner: PageScanner,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// System DNS through tokio.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await?
                .collect::<Vec<_>>();
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Drops private addresses from every lookup the HTTP client makes, the
/// initial request and redirect hops alike. The connection is made to the
/// checked addresses, so a second lookup cannot swap them.
pub struct GuardedResolver {
    inner: Arc<dyn Resolve>,
    block_private: bool,
}

impl GuardedResolver {
    pub fn new(inner: Arc<dyn Resolve>, policy: &FetchPolicy) -> Self {
        Self {
            inner,
            block_private: !policy.allow_private_network,
        }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let lookup = self.inner.resolve(name);
        let block_private = self.block_private;
        Box::pin(async move {
            let addrs = lookup.await?;
            if !block_private {
                return Ok(addrs);
            }
            let public: Vec<SocketAddr> = addrs.filter(|addr| !is_private_ip(addr.ip())).collect();
            if public.is_empty() {
                tracing::debug!(host = %host, "refusing private dns answer");
                return Err(UrlRejection::PrivateResolution(host).into());
            }
            Ok::<Addrs, BoxError>(Box::new(public.into_iter()))
        })
    }
}

impl MetadataFetcher {
    pub fn new(policy: FetchPolicy) -> anyhow::Result<Self> {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    /// Fetcher resolving host names through `resolver`, still guarded by
    /// `policy`.
    pub fn with_resolver(policy: FetchPolicy, resolver: Arc<dyn Resolve>) -> anyhow::Result<Self> {
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= policy.max_redirects {
                attempt.error("too many redirects")
            } else if let Err(err) = check_url(attempt.url(), &policy) {
                attempt.error(err)
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(policy.timeout)
            .connect_timeout(policy.connect_timeout)
            .redirect(redirect)
            .dns_resolver(Arc::new(GuardedResolver::new(resolver, &policy)))
            .no_proxy()
            .build()
            .context("failed to build metadata HTTP client")?;

        Ok(Self {
            client,
            policy,
            retry: RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            scanner: PageScanner::new().context("invalid page scanner pattern")?,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Metadata for every URL, in request order. Malformed URLs and
    /// batches outside `1..=MAX_BATCH_URLS` are rejected as a whole;
    /// per-URL failures come back as entries with `status: error`.
    pub async fn fetch_batch(&self, urls: &[String]) -> ChatResult<Vec<LinkMetadata>> {
        if urls.is_empty() || urls.len() > MAX_BATCH_URLS {
            return Err(ChatError::validation(format!(
                "between 1 and {MAX_BATCH_URLS} URLs are required"
            )));
        }
        for raw in urls {
            let url = Url::parse(raw)
                .map_err(|_| ChatError::validation(format!("Invalid URL: {raw}")))?;
            if url.scheme() != "https" && !(self.policy.allow_http && url.scheme() == "http") {
                return Err(ChatError::validation(format!("Invalid URL: {raw}")));
            }
        }

        let mut results = Vec::with_capacity(urls.len());
        for (group, chunk) in urls.chunks(CONCURRENT_FETCHES).enumerate() {
            if group > 0 {
                tokio::time::sleep(GROUP_PAUSE).await;
            }
            results.extend(join_all(chunk.iter().map(|url| self.fetch(url))).await);
        }
        Ok(results)
    }

    pub async fn fetch(&self, raw: &str) -> LinkMetadata {
        let url = match validate_url(raw, &self.policy) {
            Ok(url) => sanitize_url(&url),
            Err(err) => {
                tracing::debug!(url = raw, "rejected metadata url: {err}");
                return LinkMetadata::failed(raw, "Invalid URL", "URL failed validation", err.to_string());
            }
        };

        let result = with_retry(&self.retry, || self.download(url.clone())).await;
        match result {
            Ok((html, final_url)) => {
                let page = self.scanner.scan(&html, &final_url);
                LinkMetadata {
                    url: raw.to_string(),
                    title: page.title.unwrap_or_else(|| default_title(&final_url)),
                    description: page
                        .description
                        .unwrap_or_else(|| "No description available".to_string()),
                    favicon: favicon_url(final_url.as_str()),
                    image: page.image,
                    final_url: final_url.to_string(),
                    error: None,
                    status: FetchStatus::Success,
                }
            }
            Err(err) => {
                tracing::warn!(url = raw, "failed to fetch metadata: {err:#}");
                LinkMetadata::failed(raw, "Failed to fetch", describe_failure(&err), format!("{err:#}"))
            }
        }
    }

    async fn download(&self, url: Url) -> anyhow::Result<(String, Url)> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await?
            .error_for_status()?;
        let final_url = response.url().clone();

        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_BODY_BYTES)
        {
            anyhow::bail!("response exceeds {MAX_BODY_BYTES} bytes");
        }
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                anyhow::bail!("response exceeds {MAX_BODY_BYTES} bytes");
            }
            body.extend_from_slice(&chunk);
        }

        if body.len() < MIN_HTML_BYTES {
            anyhow::bail!("received empty or minimal content");
        }
        Ok((String::from_utf8_lossy(&body).into_owned(), final_url))
    }
}
