//! NTLM credentials.


use std::fmt;

use zeroize::Zeroizing;

use crate::error::{Error, Result};


/// Standard NTLM credentials, consisting of domain, username and password.
///
/// Obtained from an identifier of the form `DOMAIN\username`. The domain is upper-cased; the
/// username is kept exactly as given. The password is wiped from memory when the credentials are
/// dropped and never shows up in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    raw_user: String,
    domain: String,
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Parses a `DOMAIN\username` identifier and pairs it with `password`.
    ///
    /// The identifier is split on the first backslash only, so the username may itself contain
    /// backslashes.
    pub fn parse(identifier: &str, password: impl Into<String>) -> Result<Self> {
        let (domain, username) = identifier.split_once('\\')
            .ok_or_else(|| Error::MalformedCredential { identifier: identifier.to_owned() })?;

        Ok(Self {
            raw_user: identifier.to_owned(),
            domain: domain.to_uppercase(),
            username: username.to_owned(),
            password: Zeroizing::new(password.into()),
        })
    }

    /// The identifier as originally supplied (`DOMAIN\username`).
    pub fn raw_user(&self) -> &str {
        &self.raw_user
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"(secret)")
            .finish()
    }
}
