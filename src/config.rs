use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::cache::validator::CacheInterceptor;
use crate::source::traits::ConnectionFactory;

/// Protocol version advertised in the user agent and request headers.
pub const SDK_VERSION: &str = "2.0.0";

/// Product token appended to the host user agent.
pub const USER_AGENT_PRODUCT: &str = "PageSession";

/// Name of the renderer thread that serves file requests. Interception on any
/// other thread defers cookie writes to a background task.
pub const RENDERER_FILE_THREAD: &str = "Chrome_FileThread";

/// Response header carrying the entity tag of the full page.
pub const HEADER_ETAG: &str = "etag";

/// Response header naming a custom header to read the entity tag from.
pub const HEADER_ETAG_KEY: &str = "page-etag-key";

/// Request/response header carrying the template validator.
pub const HEADER_TEMPLATE_TAG: &str = "template-tag";

/// Response header: "false" or "0" when only the data portion changed.
pub const HEADER_TEMPLATE_CHANGE: &str = "template-change";

/// Response header with the cache-offline directive.
pub const HEADER_CACHE_OFFLINE: &str = "cache-offline";

/// Response header with the digest of the full html.
pub const HEADER_HTML_DIGEST: &str = "html-digest";

/// Response header with `;` separated sub-resource urls to pre-fetch.
pub const HEADER_LINK: &str = "page-link";

/// Request header announcing that the client accepts data-only responses.
pub const HEADER_ACCEPT_DIFF: &str = "accept-diff";

/// Request header carrying [`SDK_VERSION`].
pub const HEADER_SDK_VERSION: &str = "page-sdk-version";

pub const HEADER_COOKIE: &str = "cookie";
pub const HEADER_SET_COOKIE: &str = "set-cookie";
pub const HEADER_USER_AGENT: &str = "user-agent";
pub const HEADER_IF_NONE_MATCH: &str = "if-none-match";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CACHE_CONTROL: &str = "cache-control";

/// Charset used for cached pages and whenever the response names none.
pub const DEFAULT_CHARSET: &str = "utf-8";

/// Eviction starts once the cache grows beyond this share of its budget.
pub const TRIM_HIGH_WATER: f64 = 0.8;

/// Eviction stops once the cache shrinks to this share of its budget.
pub const TRIM_LOW_WATER: f64 = 0.25;

/// Diff payloads older than this are not delivered to the page.
pub const DIFF_DELIVERY_WINDOW_MS: i64 = 30 * 1000;

/// Minimum spacing between two result deliveries on reload.
pub const RELOAD_NOTIFY_SPACING_MS: i64 = 2000;

const MB: u64 = 1024 * 1024;
const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Global configuration shared by every session the engine creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the preload pool.
    pub max_preload_sessions: usize,
    /// How long a session id stays unavailable after `cache-offline: http`.
    pub unavailable_time_ms: u64,
    /// Page cache budget in bytes.
    pub cache_max_size: u64,
    /// Sub-resource cache budget in bytes.
    pub resource_cache_max_size: u64,
    /// Minimum interval between two automatic trims.
    pub cache_check_interval_ms: u64,
    /// Concurrent sub-resource downloads per fetcher.
    pub max_downloading_tasks: usize,
    /// Lifetime of cached sub-resources and of pages without cache-control.
    pub resource_max_age_ms: u64,
    /// Verify cached files by digest; otherwise by recorded size.
    pub verify_cache_with_digest: bool,
    /// Read the cookie once when the session is created.
    pub cookie_on_session_create: bool,
    /// Directory holding page cache files.
    pub cache_dir: String,
    /// Directory holding sub-resource cache files.
    pub resource_cache_dir: String,
    /// Concurrent session flows.
    pub max_session_workers: usize,
    /// Bound on the renderer's wait for the main resource.
    pub resource_wait_timeout_ms: u64,
    /// Bound on the renderer's wait for a sub-resource stream.
    pub sub_resource_wait_timeout_ms: u64,
    /// Grace period before a deferred destroy is forced.
    pub force_destroy_delay_ms: u64,
    /// Delay before a scheduled cache write runs.
    pub save_cache_delay_ms: u64,
    /// Delay before the bad-network notice is shown.
    pub bad_network_toast_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_preload_sessions: 5,
            unavailable_time_ms: 6 * HOUR_MS,
            cache_max_size: 30 * MB,
            resource_cache_max_size: 60 * MB,
            cache_check_interval_ms: 24 * HOUR_MS,
            max_downloading_tasks: 3,
            resource_max_age_ms: 5 * MINUTE_MS,
            verify_cache_with_digest: true,
            cookie_on_session_create: true,
            cache_dir: String::new(),
            resource_cache_dir: String::new(),
            max_session_workers: 6,
            resource_wait_timeout_ms: 30 * 1000,
            sub_resource_wait_timeout_ms: 3 * 1000,
            force_destroy_delay_ms: 6 * 1000,
            save_cache_delay_ms: 1500,
            bad_network_toast_delay_ms: 1500,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| anyhow!("invalid engine config: {}", e))?;
        if config.cache_dir.is_empty() || config.resource_cache_dir.is_empty() {
            return Err(anyhow!("cache_dir and resource_cache_dir are required"));
        }
        Ok(config)
    }

    pub fn resource_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_wait_timeout_ms)
    }

    pub fn sub_resource_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_resource_wait_timeout_ms)
    }

    pub fn force_destroy_delay(&self) -> Duration {
        Duration::from_millis(self.force_destroy_delay_ms)
    }

    pub fn save_cache_delay(&self) -> Duration {
        Duration::from_millis(self.save_cache_delay_ms)
    }

    pub fn bad_network_toast_delay(&self) -> Duration {
        Duration::from_millis(self.bad_network_toast_delay_ms)
    }
}

/// How a session hands content to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SessionMode {
    /// Inject a complete html string once the renderer is ready.
    Quick,
    /// Answer the renderer's resource request with a (possibly bridged) stream.
    Standard,
}

/// Per-session policy. Built once and never mutated.
#[derive(Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub read_buffer_size: usize,
    /// Preload entries older than this are discarded on lookup; zero disables expiry.
    pub preload_expiry: Duration,
    pub accept_diff: bool,
    pub account_related: bool,
    pub reload_in_bad_network: bool,
    pub auto_start: bool,
    pub support_cache_control: bool,
    pub support_local_split: bool,
    /// Notice shown when cached content is used without network. Empty disables it.
    pub bad_network_toast: String,
    pub mode: SessionMode,
    pub cache_interceptors: Vec<Arc<dyn CacheInterceptor>>,
    pub connection_factory: Option<Arc<dyn ConnectionFactory>>,
    pub custom_request_headers: HashMap<String, String>,
    pub custom_response_headers: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
            read_buffer_size: 10 * 1024,
            preload_expiry: Duration::from_secs(3 * 60),
            accept_diff: true,
            account_related: true,
            reload_in_bad_network: false,
            auto_start: true,
            support_cache_control: false,
            support_local_split: false,
            bad_network_toast: "Bad Network!".to_string(),
            mode: SessionMode::Quick,
            cache_interceptors: Vec::new(),
            connection_factory: None,
            custom_request_headers: HashMap::new(),
            custom_response_headers: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Two configs are interchangeable for pool reuse when they deliver the same way.
impl PartialEq for SessionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode && self.support_local_split == other.support_local_split
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("mode", &self.mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("preload_expiry", &self.preload_expiry)
            .field("accept_diff", &self.accept_diff)
            .field("account_related", &self.account_related)
            .field("auto_start", &self.auto_start)
            .field("support_cache_control", &self.support_cache_control)
            .field("support_local_split", &self.support_local_split)
            .field("cache_interceptors", &self.cache_interceptors.len())
            .field("connection_factory", &self.connection_factory.is_some())
            .finish()
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn preload_expiry(mut self, expiry: Duration) -> Self {
        self.config.preload_expiry = expiry;
        self
    }

    pub fn accept_diff(mut self, enabled: bool) -> Self {
        self.config.accept_diff = enabled;
        self
    }

    pub fn account_related(mut self, enabled: bool) -> Self {
        self.config.account_related = enabled;
        self
    }

    pub fn reload_in_bad_network(mut self, enabled: bool) -> Self {
        self.config.reload_in_bad_network = enabled;
        self
    }

    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.config.auto_start = enabled;
        self
    }

    pub fn support_cache_control(mut self, enabled: bool) -> Self {
        self.config.support_cache_control = enabled;
        self
    }

    pub fn support_local_split(mut self, enabled: bool) -> Self {
        self.config.support_local_split = enabled;
        self
    }

    pub fn bad_network_toast(mut self, message: impl Into<String>) -> Self {
        self.config.bad_network_toast = message.into();
        self
    }

    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Interceptors are consulted in insertion order; the first hit wins.
    pub fn cache_interceptor(mut self, interceptor: Arc<dyn CacheInterceptor>) -> Self {
        self.config.cache_interceptors.push(interceptor);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.config.connection_factory = Some(factory);
        self
    }

    pub fn custom_request_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.config.custom_request_headers = headers;
        self
    }

    pub fn custom_response_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.config.custom_response_headers = headers;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
