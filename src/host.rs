// Collaborator contracts supplied by the embedding host: runtime services, renderer binding,
// and the template/data assembly functions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{DEFAULT_CHARSET, HEADER_CONTENT_TYPE};
use crate::source::stream::SessionStream;

/// A unit of work posted to one of the host's threads.
pub type HostTask = Box<dyn FnOnce() + Send + 'static>;

/// Services the host platform provides to every session.
pub trait SessionRuntime: Send + Sync {
    fn is_network_valid(&self) -> bool;

    fn cookie(&self, url: &str) -> Option<String>;

    fn set_cookie(&self, url: &str, cookies: &[String]) -> bool;

    fn user_agent(&self) -> String;

    /// Pre-resolved address for the url's host, if the host keeps one.
    fn host_direct_address(&self, url: &str) -> Option<String>;

    fn show_toast(&self, message: &str);

    /// Error sink for connection, integrity and persistence failures.
    fn notify_error(&self, client: Option<&Arc<dyn SessionClient>>, url: &str, code: i32);

    /// Identity policy for a url; `account_related` scopes the id to the signed-in user.
    fn make_session_id(&self, url: &str, account_related: bool) -> String;

    /// Run `task` on the renderer's main thread after `delay`.
    fn post_to_main(&self, task: HostTask, delay: Duration);

    /// Run `task` on a background thread after `delay`.
    fn post_to_background(&self, task: HostTask, delay: Duration);
}

/// The renderer view a session delivers content into.
pub trait SessionClient: Send + Sync {
    fn load_url(&self, url: &str, extras: Option<HashMap<String, String>>);

    fn load_data_with_headers(
        &self,
        base_url: &str,
        html: &str,
        mime: &str,
        charset: &str,
        history_url: &str,
        headers: &HashMap<String, String>,
    );
}

/// In-page receiver of the result document of a round.
pub trait DiffDataCallback: Send + Sync {
    fn call_back(&self, result: &str);
}

/// Answer to a renderer resource request.
pub struct ResourceResponse {
    pub mime: String,
    pub charset: String,
    pub headers: HashMap<String, String>,
    pub stream: SessionStream,
}

impl std::fmt::Debug for ResourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceResponse")
            .field("mime", &self.mime)
            .field("charset", &self.charset)
            .field("headers", &self.headers)
            .field("bridged", &self.stream.is_bridged())
            .finish()
    }
}

/// Mime type guessed from the url's file extension, `text/html` when there is none.
pub fn mime_type_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let ext = match file.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "text/html",
    };
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "text/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "text/html",
    }
}

/// Charset named by a `content-type` header, or [`DEFAULT_CHARSET`].
pub fn charset_of(headers: &HashMap<String, String>) -> String {
    headers
        .get(HEADER_CONTENT_TYPE)
        .and_then(|value| {
            value.split(';').find_map(|part| {
                let (key, charset) = part.trim().split_once('=')?;
                key.trim()
                    .eq_ignore_ascii_case("charset")
                    .then(|| charset.trim().trim_matches('"').to_ascii_lowercase())
            })
        })
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string())
}

/// A page split into its stable template and volatile data.
#[derive(Debug, Clone)]
pub struct SplitHtml {
    pub template: String,
    pub data: Value,
}

/// Template/data assembly. Implementations are pure functions of their inputs.
pub trait HtmlAssembler: Send + Sync {
    /// Separate a full page into template and data.
    fn split(&self, session_id: &str, html: &str) -> Option<SplitHtml>;

    /// Delta between the locally cached data and the server's data, as delivered to the page.
    fn compute_diff(
        &self,
        session_id: &str,
        local_data: Option<&Value>,
        server_data: &Value,
    ) -> Option<Value>;

    /// Materialize a page from the cached template and the merged data. Returns `None` when
    /// the result does not match `html_digest`.
    fn build_html(
        &self,
        session_id: &str,
        template: &str,
        local_data: Option<&Value>,
        server_data: &Value,
        html_digest: &str,
        approx_size: usize,
    ) -> Option<String>;
}
