//! The base64 token codec used during the HTTP handshake.


use base64::prelude::{BASE64_STANDARD, Engine};

use crate::config::ResponseVersion;
use crate::credentials::Credentials;
use crate::message::{AuthenticateMessage, ChallengeMessage, Flags, NegotiateMessage, OsVersion, ParsingError, StoringError};
use crate::response::{get_ntlm_time, respond_challenge_ntlm_v1, respond_challenge_ntlm_v1_extended, respond_challenge_ntlm_v2};


/// Flags requested in the Negotiate message, before the domain/workstation supplied flags.
const NEGOTIATE_FLAGS: Flags = Flags::NEGOTIATE_UNICODE
    .union(Flags::NEGOTIATE_OEM)
    .union(Flags::REQUEST_TARGET)
    .union(Flags::NEGOTIATE_NTLM)
    .union(Flags::NEGOTIATE_ALWAYS_SIGN)
    .union(Flags::NEGOTIATE_NTLM2_KEY)
    .union(Flags::NEGOTIATE_VERSION)
    .union(Flags::NEGOTIATE_128BIT)
    .union(Flags::NEGOTIATE_56BIT);

/// Of the flags the server returns in its challenge, the ones echoed in the Authenticate message.
const AUTHENTICATE_FLAGS: Flags = NEGOTIATE_FLAGS.union(Flags::NEGOTIATE_TARGET_INFO);


/// Turns credentials and server challenges into the base64 tokens carried in the `Authorization`
/// and `WWW-Authenticate` headers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NtlmCodec {
    workstation: String,
    version: ResponseVersion,
}

impl NtlmCodec {
    pub fn new(workstation: impl Into<String>, version: ResponseVersion) -> Self {
        Self {
            workstation: workstation.into(),
            version,
        }
    }

    pub fn workstation(&self) -> &str {
        &self.workstation
    }

    pub fn response_version(&self) -> ResponseVersion {
        self.version
    }

    /// Creates the Negotiate token for `raw_user` (`DOMAIN\username`).
    pub fn create_negotiate_message(&self, raw_user: &str) -> Result<String, StoringError> {
        let domain = raw_user.split_once('\\')
            .map(|(domain, _)| domain.to_uppercase())
            .unwrap_or_default();

        let mut flags = NEGOTIATE_FLAGS;
        if !domain.is_empty() {
            flags |= Flags::NEGOTIATE_DOMAIN_SUPPLIED;
        }
        if !self.workstation.is_empty() {
            flags |= Flags::NEGOTIATE_WORKSTATION_SUPPLIED;
        }

        let message = NegotiateMessage {
            flags,
            domain,
            workstation: self.workstation.clone(),
            os_version: OsVersion::CLIENT,
        };
        Ok(BASE64_STANDARD.encode(message.to_bytes()?))
    }

    /// Decodes the token of a server's `NTLM <token>` challenge.
    pub fn parse_challenge_message(&self, token: &str) -> Result<ChallengeMessage, ParsingError> {
        let bytes = BASE64_STANDARD.decode(token.trim())
            .map_err(|e| ParsingError::InvalidBase64 { reason: e.to_string() })?;
        ChallengeMessage::parse(&bytes)
    }

    /// Creates the Authenticate token answering `challenge`.
    pub fn create_authenticate_message(&self, challenge: &ChallengeMessage, creds: &Credentials) -> Result<String, StoringError> {
        let flags = challenge.flags & AUTHENTICATE_FLAGS;

        let response = match self.version {
            ResponseVersion::NtlmV1 if challenge.flags.contains(Flags::NEGOTIATE_NTLM2_KEY)
                => respond_challenge_ntlm_v1_extended(challenge.server_challenge, creds),
            ResponseVersion::NtlmV1
                => respond_challenge_ntlm_v1(challenge.server_challenge, creds),
            ResponseVersion::NtlmV2
                => respond_challenge_ntlm_v2(challenge.server_challenge, &challenge.target_info, get_ntlm_time(), creds),
        };

        let message = AuthenticateMessage {
            lm_response: response.lm_response,
            nt_response: response.nt_response,
            domain: creds.domain().to_owned(),
            user_name: creds.username().to_owned(),
            workstation: self.workstation.clone(),
            session_key: Vec::new(),
            flags,
            os_version: OsVersion::CLIENT,
        };
        Ok(BASE64_STANDARD.encode(message.to_bytes()?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(flags: Flags) -> ChallengeMessage {
        ChallengeMessage {
            target_name: "CONTOSO".to_owned(),
            flags,
            server_challenge: [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
            target_info: vec![0x02, 0x00, 0x02, 0x00, b'C', 0x00, 0x00, 0x00, 0x00, 0x00],
            os_version: OsVersion::default(),
        }
    }

    fn decode_authenticate(token: &str) -> AuthenticateMessage {
        AuthenticateMessage::parse(&BASE64_STANDARD.decode(token).unwrap()).unwrap()
    }

    #[test]
    fn negotiate_supplies_domain_and_workstation() {
        let codec = NtlmCodec::new("WS01", ResponseVersion::NtlmV1);
        let token = codec.create_negotiate_message("contoso\\alice").unwrap();
        let message = NegotiateMessage::parse(&BASE64_STANDARD.decode(token).unwrap()).unwrap();

        assert_eq!(message.domain, "CONTOSO");
        assert_eq!(message.workstation, "WS01");
        assert_eq!(message.os_version, OsVersion::CLIENT);
        assert!(message.flags.contains(NEGOTIATE_FLAGS));
        assert!(message.flags.contains(Flags::NEGOTIATE_DOMAIN_SUPPLIED | Flags::NEGOTIATE_WORKSTATION_SUPPLIED));
    }

    #[test]
    fn negotiate_omits_supplied_flags_for_empty_fields() {
        let codec = NtlmCodec::new("", ResponseVersion::NtlmV1);
        let token = codec.create_negotiate_message("\\alice").unwrap();
        let message = NegotiateMessage::parse(&BASE64_STANDARD.decode(token).unwrap()).unwrap();

        assert_eq!(message.flags, NEGOTIATE_FLAGS);
        assert_eq!(message.domain, "");
    }

    #[test]
    fn challenge_token_errors() {
        let codec = NtlmCodec::new("WS01", ResponseVersion::NtlmV1);
        assert!(matches!(codec.parse_challenge_message("not base64!"), Err(ParsingError::InvalidBase64 { .. })));
        assert!(matches!(codec.parse_challenge_message("TlRMTVNTUAA="), Err(ParsingError::ShortHeader { .. })));

        let bytes = challenge(Flags::NEGOTIATE_UNICODE).to_bytes().unwrap();
        let parsed = codec.parse_challenge_message(&BASE64_STANDARD.encode(bytes)).unwrap();
        assert_eq!(parsed.server_challenge, [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    }

    #[test]
    fn authenticate_echoes_supported_flags_only() {
        let codec = NtlmCodec::new("WS01", ResponseVersion::NtlmV1);
        let creds = Credentials::parse("Domain\\User", "Password").unwrap();
        let server_flags = Flags::NEGOTIATE_UNICODE
            | Flags::NEGOTIATE_NTLM
            | Flags::NEGOTIATE_SEAL
            | Flags::NEGOTIATE_KEY_EXCHANGE
            | Flags::TARGET_TYPE_DOMAIN;

        let message = decode_authenticate(&codec.create_authenticate_message(&challenge(server_flags), &creds).unwrap());
        assert_eq!(message.flags, Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM);
        assert_eq!(message.domain, "DOMAIN");
        assert_eq!(message.user_name, "User");
        assert_eq!(message.workstation, "WS01");
        assert!(message.session_key.is_empty());

        let expected = respond_challenge_ntlm_v1(challenge(server_flags).server_challenge, &creds);
        assert_eq!(message.lm_response, expected.lm_response);
        assert_eq!(message.nt_response, expected.nt_response);
    }

    #[test]
    fn authenticate_response_follows_version_and_flags() {
        let creds = Credentials::parse("Domain\\User", "Password").unwrap();

        let v1 = NtlmCodec::new("WS01", ResponseVersion::NtlmV1);
        let extended = decode_authenticate(&v1.create_authenticate_message(
            &challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM2_KEY),
            &creds,
        ).unwrap());
        assert_eq!(extended.lm_response.len(), 24);
        assert_eq!(&extended.lm_response[8..], &[0u8; 16]);
        assert_eq!(extended.nt_response.len(), 24);

        let v2 = NtlmCodec::new("WS01", ResponseVersion::NtlmV2);
        let message = decode_authenticate(&v2.create_authenticate_message(
            &challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_TARGET_INFO),
            &creds,
        ).unwrap());
        assert_eq!(message.lm_response.len(), 24);
        // proof, blob header, target info, terminator
        assert_eq!(message.nt_response.len(), 16 + 28 + 10 + 4);
        assert!(message.flags.contains(Flags::NEGOTIATE_TARGET_INFO));
    }
}
