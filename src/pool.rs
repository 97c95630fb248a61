//! Pooled request dispatch over authenticated connections.


use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, debug_span, info, warn, Instrument, Span};
use url::Url;

use crate::config::{PoolConfig, RequestOptions};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::factory::NtlmConnectionFactory;
use crate::http::{Headers, HttpConnection, Request};
use crate::transport::{NetTransport, Transport};


/// Creates the connections a pool hands out.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new connection; `number` counts the connections the pool has requested so far.
    async fn new_connection(&self, number: usize) -> Result<HttpConnection>;
}

/// Adjusts the headers of every request before it is sent.
pub trait HeaderMutator: Send + Sync {
    fn prepare(&self, headers: &mut Headers);
}

/// Forces `Connection: Keep-Alive`, replacing whatever value the caller set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeepAlive;

impl HeaderMutator for KeepAlive {
    fn prepare(&self, headers: &mut Headers) {
        headers.set("Connection", "Keep-Alive");
    }
}


/// A response whose body has been read completely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BufferedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// The `Location` of a redirect response.
    pub fn redirect_location(&self) -> Option<&str> {
        if self.is_redirect() {
            self.headers.get("Location")
        } else {
            None
        }
    }
}


/// A pool of connections to a single server.
///
/// Idle connections are reused in the order they were returned; new ones are requested from the
/// factory when none is idle. At most `maxsize` connections are kept idle, surplus connections
/// are closed.
pub struct ConnectionPool<F, M> {
    factory: F,
    mutator: M,
    origin: Url,
    maxsize: usize,
    default_options: RequestOptions,
    idle: Mutex<VecDeque<HttpConnection>>,
    num_connections: AtomicUsize,
    num_requests: AtomicUsize,
}

impl<F: ConnectionFactory, M: HeaderMutator> ConnectionPool<F, M> {
    pub fn new(factory: F, mutator: M, config: &PoolConfig) -> Result<Self> {
        let origin_text = config.origin();
        let origin = Url::parse(&origin_text)
            .map_err(|source| Error::InvalidUrl { url: origin_text, source })?;
        Ok(Self {
            factory,
            mutator,
            origin,
            maxsize: config.maxsize,
            default_options: config.request,
            idle: Mutex::new(VecDeque::new()),
            num_connections: AtomicUsize::new(0),
            num_requests: AtomicUsize::new(0),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn default_options(&self) -> RequestOptions {
        self.default_options
    }

    /// How many connections have been requested from the factory.
    pub fn num_connections(&self) -> usize {
        self.num_connections.load(Ordering::SeqCst)
    }

    /// How many requests have been sent, including retries and redirects.
    pub fn num_requests(&self) -> usize {
        self.num_requests.load(Ordering::SeqCst)
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Closes every idle connection.
    pub fn close(&self) {
        let closed = std::mem::take(&mut *self.idle.lock());
        debug!(count = closed.len(), "closing idle connections");
    }

    /// Whether `url` points at the scheme, host and port this pool serves.
    pub fn is_same_host(&self, url: &Url) -> bool {
        url.scheme() == self.origin.scheme()
            && url.host_str() == self.origin.host_str()
            && url.port_or_known_default() == self.origin.port_or_known_default()
    }

    /// Sends a `GET` with the pool's default options.
    pub async fn get(&self, url: &str) -> Result<BufferedResponse> {
        self.urlopen("GET", url, None, None, self.default_options).await
    }

    /// Sends a request and reads the complete response.
    ///
    /// `url` may be absolute or relative to the pool's origin. Transport failures are retried on
    /// a fresh connection and redirects are followed, both consuming `options.retries`.
    pub async fn urlopen(
        &self,
        method: &str,
        url: &str,
        body: Option<Vec<u8>>,
        headers: Option<Headers>,
        options: RequestOptions,
    ) -> Result<BufferedResponse> {
        let span = debug_span!("urlopen", method, url);
        self.dispatch(method, url, body, headers, options)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        method: &str,
        url: &str,
        body: Option<Vec<u8>>,
        headers: Option<Headers>,
        options: RequestOptions,
    ) -> Result<BufferedResponse> {
        let mut method = method.to_owned();
        let mut body = body.unwrap_or_default();
        let mut headers = headers.unwrap_or_default();
        let mut target = self.resolve(&self.origin, url, options.assert_same_host)?;
        let mut retries_left = options.retries;

        loop {
            self.mutator.prepare(&mut headers);
            let request = Request::new(method.as_str(), self.request_target(&target))
                .with_headers(headers.clone())
                .with_body(body.clone());
            request.validate().map_err(Error::InvalidRequest)?;

            let response = match self.send(&request).await {
                Ok(response) => response,
                Err(Error::Transport(source)) => {
                    if retries_left == 0 {
                        return Err(Error::MaxRetries { url: target.to_string(), source });
                    }
                    retries_left -= 1;
                    warn!(error = %source, retries_left, "retrying after transport error");
                    continue;
                },
                Err(e) => return Err(e),
            };

            if !options.redirect {
                return Ok(response);
            }
            let Some(location) = response.redirect_location().map(str::to_owned) else {
                return Ok(response);
            };
            if retries_left == 0 {
                return Err(Error::TooManyRedirects { url: target.to_string() });
            }
            retries_left -= 1;

            let next = self.resolve(&target, &location, options.assert_same_host)?;
            info!(status = response.status, from = %target, to = %next, "following redirect");
            if response.status == 303 {
                method = "GET".to_owned();
                body.clear();
            }
            target = next;
        }
    }

    fn resolve(&self, base: &Url, url: &str, assert_same_host: bool) -> Result<Url> {
        let resolved = base.join(url)
            .map_err(|source| Error::InvalidUrl { url: url.to_owned(), source })?;
        if assert_same_host && !self.is_same_host(&resolved) {
            return Err(Error::HostMismatch {
                url: resolved.to_string(),
                expected: self.origin.to_string(),
            });
        }
        Ok(resolved)
    }

    /// The request target: origin-form for this pool's own URLs, absolute-form otherwise.
    fn request_target(&self, url: &Url) -> String {
        if !self.is_same_host(url) {
            return url.to_string();
        }
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        }
    }

    async fn send(&self, request: &Request) -> Result<BufferedResponse> {
        let conn = self.get_conn().await?;
        self.num_requests.fetch_add(1, Ordering::SeqCst);
        debug!(method = %request.method, target = %request.target, "sending request");

        let mut response = conn.send(request).await?;
        let body = response.read_to_end().await?;
        let reusable = response.is_reusable();
        let (head, conn) = response.detach().await?;
        if reusable {
            self.put_conn(conn);
        }

        Ok(BufferedResponse {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
        })
    }

    async fn get_conn(&self) -> Result<HttpConnection> {
        let idle = self.idle.lock().pop_front();
        if let Some(conn) = idle {
            return Ok(conn);
        }
        let number = self.num_connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!(number, "starting new connection");
        self.factory.new_connection(number).await
    }

    fn put_conn(&self, conn: HttpConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.maxsize {
            idle.push_back(conn);
        } else {
            debug!("connection pool is full, discarding connection");
        }
    }
}


/// A connection pool whose connections are authenticated with NTLM.
pub struct NtlmConnectionPool<T = NetTransport> {
    inner: ConnectionPool<NtlmConnectionFactory<T>, KeepAlive>,
}

impl NtlmConnectionPool<NetTransport> {
    /// Creates a pool reaching the server over TCP or TLS, as configured.
    ///
    /// `identifier` has the form `DOMAIN\username`.
    pub fn new(config: PoolConfig, identifier: &str, password: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let transport = NetTransport::from_config(&config)?;
        Self::with_transport(transport, config, identifier, password)
    }
}

impl<T: Transport> NtlmConnectionPool<T> {
    /// Creates a pool opening its connections through `transport`.
    pub fn with_transport(transport: T, config: PoolConfig, identifier: &str, password: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let credentials = Arc::new(Credentials::parse(identifier, password)?);
        let factory = NtlmConnectionFactory::new(transport, &config, credentials);
        Ok(Self {
            inner: ConnectionPool::new(factory, KeepAlive, &config)?,
        })
    }

    /// Replaces the span the handshakes of this pool are logged in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.inner.factory = self.inner.factory.with_span(span);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<NtlmConnectionFactory<T>, KeepAlive> {
        &self.inner
    }

    pub fn credentials(&self) -> &Credentials {
        self.inner.factory.credentials()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.num_connections()
    }

    /// Sends a `GET` with the pool's default options.
    pub async fn get(&self, url: &str) -> Result<BufferedResponse> {
        self.urlopen("GET", url, None, None, self.inner.default_options()).await
    }

    /// Sends a request with `Connection: Keep-Alive` forced into its headers.
    pub async fn urlopen(
        &self,
        method: &str,
        url: &str,
        body: Option<Vec<u8>>,
        headers: Option<Headers>,
        options: RequestOptions,
    ) -> Result<BufferedResponse> {
        let mut headers = headers.unwrap_or_default();
        KeepAlive.prepare(&mut headers);
        self.inner.urlopen(method, url, body, Some(headers), options).await
    }

    pub fn close(&self) {
        self.inner.close()
    }
}
