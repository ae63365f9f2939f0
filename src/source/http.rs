// HTTP transport for sessions and sub-resource downloads, backed by reqwest.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, Response, Url};
use tracing::{debug, info, warn};

use super::traits::{ConnectionFactory, ConnectionRequest, ResponseHeaders, SessionConnection};

/// Clients differ only in timeouts and in a host pinned to a direct address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    connect_timeout: Duration,
    read_timeout: Duration,
    route: Option<(String, SocketAddr)>,
}

/// reqwest clients shared by every connection of one factory, so pooled connections, DNS
/// results and TLS sessions survive across page loads.
#[derive(Default)]
pub struct ClientCache {
    clients: RwLock<HashMap<ClientKey, Client>>,
}

impl ClientCache {
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Client for `request`. A direct address pins the url's host to that IP while keeping
    /// the original host name for TLS and the Host header.
    fn client_for(&self, request: &ConnectionRequest) -> Result<Client> {
        let key = ClientKey {
            connect_timeout: request.connect_timeout,
            read_timeout: request.read_timeout,
            route: route_of(request)?,
        };
        if let Some(client) = self.clients.read().get(&key) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder()
            .connect_timeout(key.connect_timeout)
            .read_timeout(key.read_timeout);
        if let Some((host, addr)) = &key.route {
            info!("http client route host={} via ip={}", host, addr.ip());
            builder = builder.resolve(host.as_str(), *addr);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn route_of(request: &ConnectionRequest) -> Result<Option<(String, SocketAddr)>> {
    let Some(address) = request.direct_address.as_deref() else {
        return Ok(None);
    };
    let ip = match address.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("ignoring direct address {}: {}", address, e);
            return Ok(None);
        }
    };
    let parsed = Url::parse(&request.url).map_err(|e| anyhow!("invalid url: {}", e))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("url has no host"))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow!("cannot determine port"))?;
    Ok(Some((host, SocketAddr::new(ip, port))))
}

pub struct HttpConnection {
    request: ConnectionRequest,
    clients: Arc<ClientCache>,
    response: Option<Response>,
    code: i32,
    headers: ResponseHeaders,
}

impl HttpConnection {
    /// A connection with a client of its own.
    pub fn new(request: ConnectionRequest) -> Self {
        Self::with_clients(request, Arc::new(ClientCache::default()))
    }

    pub fn with_clients(request: ConnectionRequest, clients: Arc<ClientCache>) -> Self {
        Self {
            request,
            clients,
            response: None,
            code: -1,
            headers: ResponseHeaders::new(),
        }
    }
}

#[async_trait]
impl SessionConnection for HttpConnection {
    async fn connect(&mut self) -> Result<()> {
        let client = self.clients.client_for(&self.request)?;
        let mut req = client.get(&self.request.url);
        for (k, v) in &self.request.headers {
            if !v.is_empty() {
                req = req.header(k.as_str(), v.as_str());
            }
        }

        let resp = req.send().await?;
        self.code = i32::from(resp.status().as_u16());

        let mut headers = ResponseHeaders::new();
        for (name, value) in resp.headers() {
            match value.to_str() {
                Ok(v) => headers.append(name.as_str(), v),
                Err(_) => debug!("skipping non-ascii header {}", name),
            }
        }
        self.headers = headers;
        debug!("http connect status={} url={}", self.code, self.request.url);
        self.response = Some(resp);
        Ok(())
    }

    fn response_code(&self) -> i32 {
        self.code
    }

    fn response_headers(&self) -> ResponseHeaders {
        self.headers.clone()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.response.as_mut() {
            Some(resp) => Ok(resp.chunk().await?),
            None => Err(anyhow!("connection is not open")),
        }
    }

    fn content_length(&self) -> Option<u64> {
        self.response.as_ref().and_then(Response::content_length)
    }

    fn disconnect(&mut self) {
        self.response = None;
    }
}

/// Default factory: connections share the factory's clients.
#[derive(Default)]
pub struct HttpConnectionFactory {
    clients: Arc<ClientCache>,
}

impl HttpConnectionFactory {
    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, request: ConnectionRequest) -> Box<dyn SessionConnection> {
        Box::new(HttpConnection::with_clients(request, Arc::clone(&self.clients)))
    }
}
