//! An HTTP(S) connection pool whose connections are authenticated with NTLM.
//!
//! Every connection the pool opens first performs the NTLM handshake against a protected path on
//! the server; the authenticated connection is then kept alive and reused for the requests issued
//! through the pool.
//!
//! Sample usage:
//! ```no_run
//! use ntlmpool::{NtlmConnectionPool, PoolConfig};
//!
//! async fn fetch_calendar(password: &str) -> Result<Vec<u8>, ntlmpool::Error> {
//!     let config = PoolConfig::new("mail.example.com")
//!         .with_auth_path("/EWS/Exchange.asmx");
//!     let pool = NtlmConnectionPool::new(config, "EXAMPLE\\alice", password)?;
//!
//!     let response = pool.get("/EWS/Exchange.asmx").await?;
//!     Ok(response.body)
//! }
//! ```


mod codec;
mod config;
mod credentials;
mod error;
mod factory;
mod http;
mod message;
mod oem;
mod pool;
mod response;
mod transport;


pub use crate::codec::NtlmCodec;
pub use crate::config::{PoolConfig, RequestOptions, ResponseVersion, Scheme};
pub use crate::credentials::Credentials;
pub use crate::error::{Error, ProtocolError, Result};
pub use crate::factory::NtlmConnectionFactory;
pub use crate::http::{Headers, HttpConnection, Request, Response, ResponseHead, Version};
pub use crate::message::{
    AuthenticateMessage, ChallengeMessage, Flags, NegotiateMessage, OsVersion, ParsingError, SecurityBuffer,
    StoringError, NTLMSSP_MAGIC,
};
pub use crate::pool::{BufferedResponse, ConnectionFactory, ConnectionPool, HeaderMutator, KeepAlive, NtlmConnectionPool};
pub use crate::response::{
    ChallengeResponse, des_long, get_ntlm_time, lm_v1_password_func, ntlm_v1_password_func, ntlm_v2_password_func,
    respond_challenge_ntlm_v1, respond_challenge_ntlm_v1_extended, respond_challenge_ntlm_v2,
};
pub use crate::transport::{AsyncReadWrite, BoxedStream, NetTransport, TcpTransport, TlsTransport, Transport};
