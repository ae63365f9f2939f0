use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Response header multimap with lowercase names, in arrival order per name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: HashMap<String, Vec<String>>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// First non-empty value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.iter().find(|v| !v.is_empty()))
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }

    /// Flatten to one value per header as handed to the renderer. `set-cookie` is dropped.
    pub fn filtered(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter(|(name, _)| name.as_str() != crate::config::HEADER_SET_COOKIE)
            .filter_map(|(name, values)| {
                values
                    .iter()
                    .find(|v| !v.is_empty())
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect()
    }
}

/// Everything needed to open one request.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub url: String,
    /// Request headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Pre-resolved IP for the url's host.
    pub direct_address: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ConnectionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            direct_address: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Raw transport for one request. `next_chunk` must be cancel safe: dropping the future
/// before it resolves must not lose body bytes.
#[async_trait]
pub trait SessionConnection: Send {
    async fn connect(&mut self) -> Result<()>;

    fn response_code(&self) -> i32;

    fn response_headers(&self) -> ResponseHeaders;

    /// Next body chunk; `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    fn content_length(&self) -> Option<u64> {
        None
    }

    fn disconnect(&mut self);
}

/// Opens connections. Sessions use the configured factory or the default HTTP one.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, request: ConnectionRequest) -> Box<dyn SessionConnection>;
}
