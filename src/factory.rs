//! The connection factory performing the NTLM handshake.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, debug_span, info, info_span, Instrument, Span};

use crate::codec::NtlmCodec;
use crate::config::PoolConfig;
use crate::credentials::Credentials;
use crate::error::{Error, ProtocolError, Result};
use crate::http::{Headers, HttpConnection, Request, Response};
use crate::message::ChallengeMessage;
use crate::pool::ConnectionFactory;
use crate::transport::Transport;


const AUTHORIZATION: &str = "Authorization";
const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
const NTLM_PREFIX: &str = "NTLM ";

/// How much of the body of the challenge response is read before it is discarded.
const PREVIEW_LEN: usize = 100;


/// Opens connections to one server and authenticates each of them with NTLM before handing it
/// out.
///
/// The handshake consists of two `GET` requests to the authentication path over the same
/// connection: the first carries the Negotiate message and is answered with a challenge, the
/// second carries the Authenticate message and must be answered with `200`. Connections that
/// fail any step are closed and never returned.
pub struct NtlmConnectionFactory<T> {
    transport: T,
    host: String,
    port: u16,
    authority: String,
    origin: String,
    auth_path: String,
    credentials: Arc<Credentials>,
    codec: NtlmCodec,
    read_timeout: Option<Duration>,
    span: Span,
}

impl<T: Transport> NtlmConnectionFactory<T> {
    pub fn new(transport: T, config: &PoolConfig, credentials: Arc<Credentials>) -> Self {
        let span = info_span!(
            "ntlm_factory",
            host = %config.host,
            port = config.port(),
            user = %credentials.raw_user(),
        );
        Self {
            transport,
            host: config.host.clone(),
            port: config.port(),
            authority: config.authority(),
            origin: config.origin(),
            auth_path: config.auth_path.clone(),
            credentials,
            codec: NtlmCodec::new(config.workstation_name(), config.response_version),
            read_timeout: config.read_timeout,
            span,
        }
    }

    /// Replaces the span every handshake of this factory is logged in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn codec(&self) -> &NtlmCodec {
        &self.codec
    }

    pub fn auth_path(&self) -> &str {
        &self.auth_path
    }

    /// Opens a new connection and authenticates it against `auth_path`.
    pub async fn establish(&self, auth_path: &str) -> Result<HttpConnection> {
        self.handshake(auth_path)
            .instrument(self.span.clone())
            .await
    }

    async fn handshake(&self, auth_path: &str) -> Result<HttpConnection> {
        let stream = self.transport.connect(&self.host, self.port).await?;
        let conn = HttpConnection::new(stream, self.authority.clone())
            .with_read_timeout(self.read_timeout);
        let mut session = HandshakeSession::new(auth_path);

        let negotiate = self.codec.create_negotiate_message(self.credentials.raw_user())?;
        let mut response = conn.send(&session.request(&negotiate)).await?;
        log_response(&response);
        let preview = response.preview(PREVIEW_LEN).await?;
        debug!(data = %String::from_utf8_lossy(&preview), "response data [...]");
        let keep_alive = response.is_reusable();
        let (head, conn) = response.detach().await?;

        let challenge = session.accept_challenge(&self.codec, &head.headers)?;
        if !keep_alive {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let authenticate = self.codec.create_authenticate_message(&challenge, &self.credentials)?;
        let mut response = conn.send(&session.request(&authenticate)).await?;
        log_response(&response);
        let body = response.read_to_end().await?;
        debug!(data = %String::from_utf8_lossy(&body[..body.len().min(PREVIEW_LEN)]), "response data [...]");

        match response.status() {
            200 => {},
            401 => return Err(Error::AuthenticationRejected {
                username: self.credentials.raw_user().to_owned(),
            }),
            status => return Err(ProtocolError::UnexpectedStatus {
                status,
                reason: response.reason().to_owned(),
            }.into()),
        }
        if !response.is_reusable() {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let (_, conn) = response.detach().await?;
        info!("connection established");
        Ok(conn)
    }
}

#[async_trait]
impl<T: Transport> ConnectionFactory for NtlmConnectionFactory<T> {
    async fn new_connection(&self, number: usize) -> Result<HttpConnection> {
        let span = debug_span!(parent: &self.span, "connection", number);
        async move {
            debug!("starting NTLM connection no. {}: {}{}", number, self.origin, self.auth_path);
            self.handshake(&self.auth_path).await
        }
            .instrument(span)
            .await
    }
}


/// The state of one handshake: the headers sent with both requests.
struct HandshakeSession<'a> {
    auth_path: &'a str,
    headers: Headers,
}

impl<'a> HandshakeSession<'a> {
    fn new(auth_path: &'a str) -> Self {
        let mut headers = Headers::new();
        headers.set("Connection", "Keep-Alive");
        Self {
            auth_path,
            headers,
        }
    }

    /// Builds the next `GET` carrying `token`.
    fn request(&mut self, token: &str) -> Request {
        self.headers.set(AUTHORIZATION, format!("{}{}", NTLM_PREFIX, token));
        debug!(headers = ?self.headers, "request headers");
        Request::get(self.auth_path).with_headers(self.headers.clone())
    }

    /// Extracts and decodes the challenge from the response to the Negotiate message.
    fn accept_challenge(&self, codec: &NtlmCodec, headers: &Headers) -> Result<ChallengeMessage> {
        let token = challenge_token(headers)?;
        let challenge = codec.parse_challenge_message(&token)
            .map_err(|source| ProtocolError::InvalidChallenge { token, source })?;
        debug!(path = self.auth_path, flags = ?challenge.flags, target = %challenge.target_name, "challenge received");
        Ok(challenge)
    }
}

/// Finds the first `NTLM <token>` among the schemes offered in `WWW-Authenticate`.
fn challenge_token(headers: &Headers) -> core::result::Result<String, ProtocolError> {
    let header = headers.get_all(WWW_AUTHENTICATE)
        .collect::<Vec<_>>()
        .join(", ");
    header.split(", ")
        .find_map(|scheme| scheme.strip_prefix(NTLM_PREFIX))
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::MissingChallenge { header: header.clone() })
}

fn log_response(response: &Response) {
    debug!(status = response.status(), reason = response.reason(), "response status");
    debug!(headers = ?response.headers(), "response headers");
}
