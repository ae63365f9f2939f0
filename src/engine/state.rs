// Session states, result codes and the pure classification of a network response.

use std::fmt;

use crate::config::HEADER_CACHE_CONTROL;
use crate::source::traits::ResponseHeaders;

/// Lifecycle of one session. Transitions only move forward, except Ready -> Running on refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    None,
    Running,
    Ready,
    Destroyed,
}

impl SessionState {
    pub fn code(self) -> i32 {
        match self {
            SessionState::None => 0,
            SessionState::Running => 1,
            SessionState::Ready => 2,
            SessionState::Destroyed => 3,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_move_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::None, SessionState::Running)
                | (SessionState::Running, SessionState::Ready)
                | (SessionState::Ready, SessionState::Running)
                | (SessionState::None, SessionState::Destroyed)
                | (SessionState::Running, SessionState::Destroyed)
                | (SessionState::Ready, SessionState::Destroyed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a round was served, as reported to the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Unknown,
    FirstLoad,
    TemplateChange,
    DataUpdate,
    HitCache,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Unknown => -1,
            ResultCode::FirstLoad => 1000,
            ResultCode::TemplateChange => 2000,
            ResultCode::DataUpdate => 200,
            ResultCode::HitCache => 304,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1000 => ResultCode::FirstLoad,
            2000 => ResultCode::TemplateChange,
            200 => ResultCode::DataUpdate,
            304 => ResultCode::HitCache,
            _ => ResultCode::Unknown,
        }
    }
}

/// The `cache-offline` response directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOffline {
    Absent,
    /// Server is unavailable; stop asking it for a while.
    Http,
    /// Persist, but do not refresh what the renderer already shows.
    Store,
    /// Persist and refresh.
    True,
    /// Refresh, never persist.
    False,
    Other,
}

impl CacheOffline {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return CacheOffline::Absent;
        };
        if value.eq_ignore_ascii_case("http") {
            CacheOffline::Http
        } else if value == "store" {
            CacheOffline::Store
        } else if value == "true" {
            CacheOffline::True
        } else if value == "false" {
            CacheOffline::False
        } else {
            CacheOffline::Other
        }
    }

    /// The new content should be persisted.
    pub fn wants_store(self) -> bool {
        matches!(self, CacheOffline::True | CacheOffline::Store)
    }

    /// The renderer should be refreshed with the new content.
    pub fn needs_refresh(self) -> bool {
        matches!(self, CacheOffline::True | CacheOffline::False)
    }
}

/// Which branch of the connection step a response takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    NotModified,
    HttpError(i32),
    ServiceUnavailable,
    FirstLoad,
    /// Directive forbids offline use; the cached page is dropped.
    DropCache,
    /// A 200 without the validators the branch needs.
    ProtocolViolation,
    DataUpdate,
    TemplateChange,
}

/// Classify a connected response. `template_change` is the raw header value.
pub fn classify(
    code: i32,
    cache_offline: CacheOffline,
    etag: Option<&str>,
    template_change: Option<&str>,
    has_cache: bool,
) -> FlowOutcome {
    if code == 304 {
        return FlowOutcome::NotModified;
    }
    if code != 200 {
        return FlowOutcome::HttpError(code);
    }
    if cache_offline == CacheOffline::Http {
        return FlowOutcome::ServiceUnavailable;
    }
    if !has_cache {
        return FlowOutcome::FirstLoad;
    }
    if matches!(cache_offline, CacheOffline::Absent | CacheOffline::False) {
        return FlowOutcome::DropCache;
    }
    let etag = etag.unwrap_or_default();
    let template_change = template_change.unwrap_or_default();
    if etag.is_empty() || template_change.is_empty() {
        return FlowOutcome::ProtocolViolation;
    }
    if is_template_unchanged(template_change) {
        FlowOutcome::DataUpdate
    } else {
        FlowOutcome::TemplateChange
    }
}

pub fn is_template_unchanged(value: &str) -> bool {
    value == "false" || value == "0"
}

/// Whether a response may be written to the page cache.
pub fn need_save_data(
    support_cache_control: bool,
    cache_offline: CacheOffline,
    headers: &ResponseHeaders,
) -> bool {
    if !cache_offline.wants_store() {
        return false;
    }
    if !support_cache_control {
        return true;
    }
    match headers.get(HEADER_CACHE_CONTROL) {
        Some(value) => {
            let value = value.to_ascii_lowercase();
            !["no-cache", "no-store", "must-revalidate"]
                .iter()
                .any(|d| value.contains(d))
        }
        None => true,
    }
}

/// Epoch millis until which a saved page is fresh: `max-age` when present, otherwise
/// `default_max_age_ms` from now.
pub fn cache_expired_time(headers: &ResponseHeaders, now: i64, default_max_age_ms: u64) -> i64 {
    let max_age_secs = headers.get(HEADER_CACHE_CONTROL).and_then(|value| {
        value.split(',').find_map(|directive| {
            let (name, secs) = directive.trim().split_once('=')?;
            if name.trim().eq_ignore_ascii_case("max-age") {
                secs.trim().trim_matches('"').parse::<i64>().ok()
            } else {
                None
            }
        })
    });
    match max_age_secs {
        Some(secs) => now + secs.max(0) * 1000,
        None => now + default_max_age_ms as i64,
    }
}
