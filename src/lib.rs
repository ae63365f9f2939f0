//! Page session engine: serves web pages to an embedded renderer from a local cache while a
//! conditional request revalidates them, then delivers the difference.
//!
//! Hosts implement [`host::SessionRuntime`], [`host::SessionClient`] and
//! [`host::HtmlAssembler`], build an [`Engine`] and ask it for a [`Session`] per navigation.

pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod host;
pub mod source;
pub mod telemetry;

pub use config::{EngineConfig, SessionConfig, SessionMode};
pub use engine::{Engine, ResultCode, Session, SessionListener, SessionState};
pub use error::SessionError;
