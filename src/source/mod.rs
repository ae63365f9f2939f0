// Network side of a session: connection abstraction, HTTP transport, response streams.

pub mod http;
pub mod server;
pub mod stream;
pub mod traits;
