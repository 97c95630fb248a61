use std::io;

use thiserror::Error;

use crate::message::{ParsingError, StoringError};


/// An error returned while establishing an NTLM-authenticated connection or issuing requests
/// through the pool.
#[derive(Debug, Error)]
pub enum Error {
    /// The user identifier is not of the form `DOMAIN\username`.
    #[error("malformed credential {identifier:?}: expected DOMAIN\\username")]
    MalformedCredential { identifier: String },

    /// Connecting, the TLS handshake, or reading from/writing to the socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The server did not follow the NTLM-over-HTTP exchange.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server answered the AUTHENTICATE message with 401.
    #[error("server rejected request: wrong username or password for {username:?}")]
    AuthenticationRejected { username: String },

    /// An NTLM message could not be encoded from the credentials.
    #[error("failed to encode NTLM message: {0}")]
    Encoding(#[from] StoringError),

    /// The pool configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A request URL could not be parsed.
    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The method, target or a header field would corrupt the request on the wire.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request URL points to a different origin than the one the pool serves.
    #[error("{url} does not belong to this pool ({expected})")]
    HostMismatch { url: String, expected: String },

    /// Every attempt to send the request failed at the transport level.
    #[error("max retries exceeded for {url}: {source}")]
    MaxRetries {
        url: String,
        #[source]
        source: io::Error,
    },

    /// The redirect chain used up the request's retries.
    #[error("too many redirects for {url}")]
    TooManyRedirects { url: String },
}

/// A violation of the NTLM-over-HTTP exchange by the server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first response carried no `NTLM <token>` entry in `WWW-Authenticate`.
    #[error("missing NTLM challenge, unexpected WWW-Authenticate response header: {header:?}")]
    MissingChallenge { header: String },

    /// The challenge token could not be decoded.
    #[error("invalid NTLM challenge {token:?}: {source}")]
    InvalidChallenge {
        token: String,
        #[source]
        source: ParsingError,
    },

    /// The AUTHENTICATE message was answered with neither 200 nor 401.
    #[error("wrong server response: {status} {reason}")]
    UnexpectedStatus { status: u16, reason: String },

    /// The server announced it would close the connection before the handshake completed.
    #[error("server closed the connection during the NTLM handshake")]
    ConnectionClosed,
}

pub type Result<T> = core::result::Result<T, Error>;
