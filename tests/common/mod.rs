#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::prelude::{BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use ntlmpool::{
    AuthenticateMessage, BoxedStream, ChallengeMessage, Credentials, Flags, NegotiateMessage, OsVersion, PoolConfig,
    Scheme, Transport, des_long, ntlm_v1_password_func, ntlm_v2_password_func, respond_challenge_ntlm_v1,
};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};


pub const IDENTIFIER: &str = "contoso\\alice";
pub const PASSWORD: &str = "hunter2";

/// Flags of the scripted challenges; without extended session security the NTLMv1 responses are
/// deterministic and can be recomputed by the server.
pub const SERVER_FLAGS: Flags = Flags::NEGOTIATE_UNICODE
    .union(Flags::NEGOTIATE_NTLM)
    .union(Flags::REQUEST_TARGET)
    .union(Flags::NEGOTIATE_TARGET_INFO);

/// Flags of a server requiring extended session security, as current Windows servers do.
pub const EXTENDED_SERVER_FLAGS: Flags = SERVER_FLAGS.union(Flags::NEGOTIATE_NTLM2_KEY);


pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> PoolConfig {
    PoolConfig::new("intranet")
        .with_scheme(Scheme::Http)
        .with_auth_path("/auth")
        .with_workstation("ws01")
}


type Handler = Arc<dyn Fn(ServerConn) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Default)]
pub struct Stats {
    pub connects: AtomicUsize,
    pub requests: AtomicUsize,
}

impl Stats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// A transport whose every connection is served in memory by a handler task.
pub struct ScriptedTransport {
    handler: Handler,
    stats: Arc<Stats>,
    refuse_first: usize,
}

impl ScriptedTransport {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ServerConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |conn| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(handler(conn)) }),
            stats: Arc::new(Stats::default()),
            refuse_first: 0,
        }
    }

    /// A transport whose connections perform the handshake and then run [`serve_routes`].
    pub fn ntlm_server() -> Self {
        Self::new(|conn| async move {
            let challenge = challenge_for(conn.number);
            ntlm_server(conn, challenge).await
        })
    }

    /// Refuses the first `count` connection attempts.
    pub fn refusing_first(mut self, count: usize) -> Self {
        self.refuse_first = count;
        self
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        let number = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if number <= self.refuse_first {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        let (client, server) = duplex(64 * 1024);
        let conn = ServerConn {
            reader: BufReader::new(server),
            number,
            stats: Arc::clone(&self.stats),
        };
        tokio::spawn((self.handler)(conn));
        Ok(Box::new(client))
    }
}


#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn ntlm_token(&self) -> Option<&str> {
        self.header("Authorization")?.strip_prefix("NTLM ")
    }
}

/// The server end of a scripted connection.
pub struct ServerConn {
    reader: BufReader<DuplexStream>,
    pub number: usize,
    stats: Arc<Stats>,
}

impl ServerConn {
    /// Reads the next request; `None` once the client has gone away.
    pub async fn read_request(&mut self) -> Option<ReceivedRequest> {
        let request_line = self.read_line().await?;
        let mut parts = request_line.split(' ');
        let method = parts.next()?.to_owned();
        let target = parts.next()?.to_owned();

        let mut headers = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        let length = headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await.ok()?;

        self.stats.requests.fetch_add(1, Ordering::SeqCst);
        Some(ReceivedRequest { method, target, headers, body })
    }

    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_owned()),
        }
    }

    pub async fn respond(&mut self, status: u16, reason: &str, headers: &[(&str, &str)], body: &[u8]) {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(body);
        self.respond_raw(&bytes).await;
    }

    pub async fn respond_raw(&mut self, bytes: &[u8]) {
        let _ = self.reader.get_mut().write_all(bytes).await;
    }
}


/// A server challenge unique to the connection number.
pub fn challenge_for(number: usize) -> [u8; 8] {
    let mut challenge = (number as u64).to_le_bytes();
    challenge[7] = 0x5A;
    challenge
}

pub fn challenge_token(server_challenge: [u8; 8]) -> String {
    challenge_token_with_flags(server_challenge, SERVER_FLAGS)
}

pub fn challenge_token_with_flags(server_challenge: [u8; 8], flags: Flags) -> String {
    let message = ChallengeMessage {
        target_name: "CONTOSO".to_owned(),
        flags,
        server_challenge,
        target_info: vec![
            0x02, 0x00, 0x0E, 0x00, b'C', 0, b'O', 0, b'N', 0, b'T', 0, b'O', 0, b'S', 0, b'O', 0,
            0x00, 0x00, 0x00, 0x00,
        ],
        os_version: OsVersion::default(),
    };
    BASE64_STANDARD.encode(message.to_bytes().unwrap())
}

pub fn is_negotiate(token: &str) -> bool {
    BASE64_STANDARD.decode(token).ok()
        .and_then(|bytes| NegotiateMessage::parse(&bytes).ok())
        .is_some()
}

/// Checks an Authenticate token the way a domain controller would, for either response version.
pub fn verify_authenticate(token: &str, server_challenge: [u8; 8], identifier: &str, password: &str) -> bool {
    let Some(message) = BASE64_STANDARD.decode(token).ok()
        .and_then(|bytes| AuthenticateMessage::parse(&bytes).ok())
    else {
        return false;
    };
    let creds = Credentials::parse(identifier, password).unwrap();
    if message.user_name != creds.username() || message.domain != creds.domain() {
        return false;
    }

    let extended = message.flags.contains(Flags::NEGOTIATE_NTLM2_KEY);
    if message.nt_response.len() == 24 && extended {
        // the LM field carries the client challenge, padded with zeros
        if message.lm_response.len() != 24 || message.lm_response[8..] != [0u8; 16] {
            return false;
        }
        let digest = Md5::new()
            .chain_update(server_challenge)
            .chain_update(&message.lm_response[..8])
            .finalize();
        let mut session_nonce = [0u8; 8];
        session_nonce.copy_from_slice(&digest[..8]);
        let expected = des_long(ntlm_v1_password_func(creds.password()), session_nonce);
        message.nt_response == expected
    } else if message.nt_response.len() == 24 {
        let expected = respond_challenge_ntlm_v1(server_challenge, &creds);
        message.nt_response == expected.nt_response && message.lm_response == expected.lm_response
    } else {
        let key = ntlm_v2_password_func(creds.password(), creds.username(), creds.domain());
        let (proof, blob) = message.nt_response.split_at(16);
        let mut mac = <Hmac<Md5> as Mac>::new_from_slice(&key).unwrap();
        mac.update(&server_challenge);
        mac.update(blob);
        mac.verify_slice(proof).is_ok()
    }
}


/// Performs the server side of the handshake, then answers requests through [`serve_routes`].
pub async fn ntlm_server(conn: ServerConn, server_challenge: [u8; 8]) {
    ntlm_server_with_flags(conn, server_challenge, SERVER_FLAGS).await
}

/// Like [`ntlm_server`], with the given flags in the challenge.
pub async fn ntlm_server_with_flags(mut conn: ServerConn, server_challenge: [u8; 8], flags: Flags) {
    let Some(request) = conn.read_request().await else { return };
    if !request.ntlm_token().map(is_negotiate).unwrap_or(false) {
        conn.respond(400, "Bad Request", &[], b"expected negotiate").await;
        return;
    }
    let challenge_header = format!("NTLM {}", challenge_token_with_flags(server_challenge, flags));
    conn.respond(
        401,
        "Unauthorized",
        &[("WWW-Authenticate", "Negotiate"), ("WWW-Authenticate", challenge_header.as_str())],
        &[b'x'; 512],
    ).await;

    let Some(request) = conn.read_request().await else { return };
    let accepted = request.ntlm_token()
        .map(|token| verify_authenticate(token, server_challenge, IDENTIFIER, PASSWORD))
        .unwrap_or(false);
    if !accepted {
        conn.respond(401, "Unauthorized", &[("WWW-Authenticate", "NTLM")], b"access denied").await;
        return;
    }
    conn.respond(200, "OK", &[], b"welcome").await;

    serve_routes(conn).await;
}

/// Answers requests after the handshake.
///
/// - `/redirect` redirects to `/data`
/// - `/see-other` answers 303 pointing to `/data`
/// - `/loop` redirects to itself
/// - `/external` redirects to another host
/// - `/close` answers and closes the connection
/// - anything else echoes method, target and `Connection` header
pub async fn serve_routes(mut conn: ServerConn) {
    while let Some(request) = conn.read_request().await {
        match request.target.as_str() {
            "/redirect" => conn.respond(302, "Found", &[("Location", "/data")], b"").await,
            "/see-other" => conn.respond(303, "See Other", &[("Location", "/data")], b"").await,
            "/loop" => conn.respond(301, "Moved Permanently", &[("Location", "/loop")], b"").await,
            "/external" => conn.respond(302, "Found", &[("Location", "https://elsewhere.example/")], b"").await,
            "/close" => {
                conn.respond(200, "OK", &[("Connection", "close")], b"bye").await;
                return;
            },
            _ => {
                let echo = format!(
                    "{} {} {} {}",
                    request.method,
                    request.target,
                    request.header("Connection").unwrap_or("-"),
                    String::from_utf8_lossy(&request.body),
                );
                conn.respond(200, "OK", &[], echo.trim_end().as_bytes()).await;
            },
        }
    }
}
