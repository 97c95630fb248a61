//! A minimal HTTP/1.1 client connection.
//!
//! A [`HttpConnection`] is consumed when a request is sent and comes back out of the [`Response`]
//! through [`Response::detach`] once the body has been dealt with. Dropping a response instead
//! closes the socket.


use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::transport::{with_timeout, BoxedStream};


/// Longest accepted status, header or chunk-size line.
const MAX_LINE_LEN: u64 = 8 * 1024;

/// Most header lines accepted in one response.
const MAX_HEADERS: usize = 128;

const DISCARD_CHUNK_LEN: usize = 8 * 1024;


fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// RFC 7230 `tchar`: the characters allowed in methods and header names.
fn is_token(text: &str) -> bool {
    !text.is_empty()
        && text.bytes().all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}


/// An ordered list of header fields with case-insensitive names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first value of the header `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of the header `name`, in order of appearance.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of the header `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Removes every value of the header `name`; returns whether there was any.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the comma-separated header `name` lists `token`.
    fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}


/// A request to be sent over a [`HttpConnection`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub method: String,

    /// The request target, usually an absolute path with an optional query.
    pub target: String,

    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Checks that the request line and every header field can be written without changing the
    /// framing of the message.
    pub fn validate(&self) -> Result<(), String> {
        if !is_token(&self.method) {
            return Err(format!("invalid method {:?}", self.method));
        }
        if self.target.is_empty() || self.target.bytes().any(|b| b <= b' ' || b == 0x7F) {
            return Err(format!("invalid request target {:?}", self.target));
        }
        for (name, value) in self.headers.iter() {
            if !is_token(name) {
                return Err(format!("invalid header name {:?}", name));
            }
            if value.contains(['\r', '\n', '\0']) {
                return Err(format!("invalid value for header {:?}: {:?}", name, value));
            }
        }
        Ok(())
    }

    /// Serializes the request, adding `Host` and `Content-Length` unless already present.
    fn to_bytes(&self, authority: &str) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        if !self.headers.contains("Host") {
            head.push_str(&format!("Host: {}\r\n", authority));
        }
        for (name, value) in self.headers.iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        let method_has_body = matches!(self.method.as_str(), "POST" | "PUT" | "PATCH");
        if (method_has_body || !self.body.is_empty())
            && !self.headers.contains("Content-Length")
            && !self.headers.contains("Transfer-Encoding")
        {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Version {
    Http10,
    Http11,
}

/// Status line and headers of a response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Whether the server intends to keep the connection open after this response.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            false
        } else if self.headers.has_token("Connection", "keep-alive") {
            true
        } else {
            self.version == Version::Http11
        }
    }

    fn parse_status_line(line: &str) -> io::Result<(Version, u16, String)> {
        let mut parts = line.splitn(3, ' ');
        let version = match parts.next() {
            Some("HTTP/1.1") => Version::Http11,
            Some("HTTP/1.0") => Version::Http10,
            _ => return Err(invalid_data(format!("malformed status line {:?}", line))),
        };
        let status = parts.next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| invalid_data(format!("malformed status line {:?}", line)))?;
        let reason = parts.next().unwrap_or("").to_owned();
        Ok((version, status, reason))
    }
}


/// How the end of a response body is recognized, and how far reading has progressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Body {
    Done,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    UntilClose,
}

impl Body {
    fn for_response(method: &str, head: &ResponseHead) -> io::Result<Self> {
        if method.eq_ignore_ascii_case("HEAD") || matches!(head.status, 100..=199 | 204 | 304) {
            return Ok(Self::Done);
        }

        let chunked = head.headers.get_all("Transfer-Encoding")
            .flat_map(|value| value.split(','))
            .last()
            .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        if chunked {
            return Ok(Self::ChunkSize);
        }

        match head.headers.get("Content-Length") {
            Some(value) => {
                let length: u64 = value.trim().parse()
                    .map_err(|_| invalid_data(format!("invalid Content-Length {:?}", value)))?;
                Ok(if length == 0 { Self::Done } else { Self::Length(length) })
            },
            None => Ok(Self::UntilClose),
        }
    }
}


/// An HTTP/1.1 connection to a single server.
pub struct HttpConnection {
    stream: BufReader<BoxedStream>,
    authority: String,
    read_timeout: Option<Duration>,
    requests_sent: u64,
}

impl HttpConnection {
    /// Wraps a connected stream; `authority` is sent as `Host` unless a request sets its own.
    pub fn new(stream: BoxedStream, authority: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            authority: authority.into(),
            read_timeout: None,
            requests_sent: 0,
        }
    }

    /// Bounds every read and write on this connection.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    /// Sends `request` and reads the head of the final (non-1xx) response.
    ///
    /// A request failing [`Request::validate`] is not sent and yields
    /// [`io::ErrorKind::InvalidInput`].
    pub async fn send(mut self, request: &Request) -> io::Result<Response> {
        request.validate()
            .map_err(|reason| io::Error::new(io::ErrorKind::InvalidInput, reason))?;
        let bytes = request.to_bytes(&self.authority);
        self.write_all(&bytes).await?;
        self.requests_sent += 1;

        let head = self.read_head().await?;
        let body = Body::for_response(&request.method, &head)?;
        let keep_alive = head.keep_alive() && body != Body::UntilClose;
        Ok(Response {
            head,
            conn: self,
            body,
            keep_alive,
        })
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.stream.get_mut();
        with_timeout(self.read_timeout, async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        }).await
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_timeout(self.read_timeout, self.stream.read(buf)).await
    }

    /// Reads one CRLF- or LF-terminated line, without the terminator.
    async fn read_line(&mut self) -> io::Result<String> {
        let stream = &mut self.stream;
        let line = with_timeout(self.read_timeout, async move {
            let mut line = Vec::new();
            stream.take(MAX_LINE_LEN).read_until(b'\n', &mut line).await?;
            Ok(line)
        }).await?;

        if line.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"));
        }
        if line.last() != Some(&b'\n') {
            return Err(if line.len() as u64 >= MAX_LINE_LEN {
                invalid_data("line too long")
            } else {
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed in the middle of a line")
            });
        }
        let text = String::from_utf8_lossy(&line);
        Ok(text.trim_end_matches(['\r', '\n']).to_owned())
    }

    async fn read_head(&mut self) -> io::Result<ResponseHead> {
        loop {
            let status_line = self.read_line().await?;
            let (version, status, reason) = ResponseHead::parse_status_line(&status_line)?;

            let mut headers = Headers::new();
            loop {
                let line = self.read_line().await?;
                if line.is_empty() {
                    break;
                }
                if headers.len() >= MAX_HEADERS {
                    return Err(invalid_data("too many header fields"));
                }
                let (name, value) = line.split_once(':')
                    .ok_or_else(|| invalid_data(format!("malformed header line {:?}", line)))?;
                headers.append(name.trim(), value.trim());
            }

            // interim responses precede the actual one
            if (100..200).contains(&status) && status != 101 {
                continue;
            }
            return Ok(ResponseHead { version, status, reason, headers });
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("authority", &self.authority)
            .field("read_timeout", &self.read_timeout)
            .field("requests_sent", &self.requests_sent)
            .finish_non_exhaustive()
    }
}


/// A response whose body is still on the wire.
pub struct Response {
    head: ResponseHead,
    conn: HttpConnection,
    body: Body,
    keep_alive: bool,
}

impl Response {
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Whether the connection can carry another request once this response has been read.
    pub fn is_reusable(&self) -> bool {
        self.keep_alive
    }

    /// Reads the next piece of the body into `buf`; returns 0 at the end of the body.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.body {
                Body::Done => return Ok(0),
                Body::Length(remaining) => {
                    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let read = self.read_body_bytes(&mut buf[..want]).await?;
                    let remaining = remaining - read as u64;
                    self.body = if remaining == 0 { Body::Done } else { Body::Length(remaining) };
                    return Ok(read);
                },
                Body::ChunkSize => {
                    let line = self.conn.read_line().await?;
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16)
                        .map_err(|_| invalid_data(format!("invalid chunk size {:?}", line)))?;
                    if size == 0 {
                        // skip trailer fields up to the final empty line
                        while !self.conn.read_line().await?.is_empty() {}
                        self.body = Body::Done;
                    } else {
                        self.body = Body::ChunkData(size);
                    }
                },
                Body::ChunkData(remaining) => {
                    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let read = self.read_body_bytes(&mut buf[..want]).await?;
                    let remaining = remaining - read as u64;
                    if remaining == 0 {
                        let terminator = self.conn.read_line().await?;
                        if !terminator.is_empty() {
                            return Err(invalid_data("chunk data not followed by CRLF"));
                        }
                        self.body = Body::ChunkSize;
                    } else {
                        self.body = Body::ChunkData(remaining);
                    }
                    return Ok(read);
                },
                Body::UntilClose => {
                    let read = self.conn.read_raw(buf).await?;
                    if read == 0 {
                        self.body = Body::Done;
                    }
                    return Ok(read);
                },
            }
        }
    }

    async fn read_body_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.conn.read_raw(buf).await?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before the end of the body"));
        }
        Ok(read)
    }

    /// Reads at most `limit` bytes of the body, leaving the rest unread.
    pub async fn preview(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; limit];
        let mut filled = 0;
        while filled < limit {
            let read = self.read_some(&mut data[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Reads the remainder of the body.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = [0u8; DISCARD_CHUNK_LEN];
        loop {
            let read = self.read_some(&mut buf).await?;
            if read == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..read]);
        }
    }

    /// Discards the unread remainder of the body and hands back the connection.
    ///
    /// Only a connection for which [`is_reusable`](Self::is_reusable) held can carry another
    /// request.
    pub async fn detach(mut self) -> io::Result<(ResponseHead, HttpConnection)> {
        let mut buf = [0u8; DISCARD_CHUNK_LEN];
        while self.read_some(&mut buf).await? > 0 {}
        Ok((self.head, self.conn))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("head", &self.head)
            .field("conn", &self.conn)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}
