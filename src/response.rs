//! Calculation of the responses to an NTLM challenge.


use chrono::Utc;
use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use des::Des;
use digest::Digest;
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::Md5;
use rand::Rng;
use rand::rngs::OsRng;

use crate::credentials::Credentials;
use crate::oem;


/// Hundreds of nanoseconds between 1601-01-01 (the Windows epoch) and 1970-01-01.
const WINDOWS_EPOCH_OFFSET: i64 = 116_444_736_000_000_000;


/// The LM and NT responses to an NTLM challenge.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChallengeResponse {
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
}


/// Obtains the current time as a Windows FILETIME (tenths of a microsecond since 1601).
pub fn get_ntlm_time() -> i64 {
    Utc::now().timestamp_micros() * 10 + WINDOWS_EPOCH_OFFSET
}

fn random_client_challenge() -> [u8; 8] {
    let mut client_challenge = [0u8; 8];
    OsRng.fill(&mut client_challenge);
    client_challenge
}

fn utf16_le(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}


/// Spreads 56 key bits over the upper seven bits of each byte of a DES key. The low bit of every
/// byte is a parity bit, which DES ignores.
fn expand_des_key(key: &[u8; 7]) -> [u8; 8] {
    [
        key[0],
        (key[0] << 7) | (key[1] >> 1),
        (key[1] << 6) | (key[2] >> 2),
        (key[2] << 5) | (key[3] >> 3),
        (key[3] << 4) | (key[4] >> 4),
        (key[4] << 3) | (key[5] >> 5),
        (key[5] << 2) | (key[6] >> 6),
        key[6] << 1,
    ]
}

fn des_encrypt(key: &[u8; 7], data: [u8; 8]) -> [u8; 8] {
    let cipher = Des::new(&GenericArray::from(expand_des_key(key)));
    let mut block = GenericArray::from(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Performs the NTLMv1 DES encryption (DESL) to calculate the response value to the challenge.
///
/// The 16-byte key is padded to 21 bytes and split into three 7-byte DES keys, each of which
/// encrypts `data`; the three ciphertexts are concatenated.
pub fn des_long(key: [u8; 16], data: [u8; 8]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(&key);

    let mut ret = [0u8; 24];
    for (i, chunk) in ret.chunks_exact_mut(8).enumerate() {
        let mut des_key = [0u8; 7];
        des_key.copy_from_slice(&padded[7 * i..7 * (i + 1)]);
        chunk.copy_from_slice(&des_encrypt(&des_key, data));
    }
    ret
}


/// Derives the LMv1 key from a password.
///
/// The password is upper-cased, encoded in the OEM character set and truncated or zero-padded to
/// 14 bytes; each 7-byte half is used as a DES key to encrypt the constant `KGS!@#$%`. A password
/// that cannot be represented in the OEM character set yields an all-zero key.
pub fn lm_v1_password_func(password: &str) -> [u8; 16] {
    let mut password_bytes = match oem::encode(&password.to_uppercase()) {
        Some(bytes) => bytes,
        None => return [0; 16],
    };
    password_bytes.resize(14, 0x00);

    let mut output = [0u8; 16];
    for (half, key) in output.chunks_exact_mut(8).zip(password_bytes.chunks_exact(7)) {
        let mut des_key = [0u8; 7];
        des_key.copy_from_slice(key);
        half.copy_from_slice(&des_encrypt(&des_key, *b"KGS!@#$%"));
    }
    output
}

/// Derives the NTLMv1 key from a password: MD4 over the UTF-16LE password.
pub fn ntlm_v1_password_func(password: &str) -> [u8; 16] {
    Md4::digest(utf16_le(password)).into()
}

/// Derives the NTLMv2 key: HMAC-MD5 keyed with the NTLMv1 key over the upper-cased username
/// followed by the domain, both UTF-16LE.
pub fn ntlm_v2_password_func(password: &str, username: &str, domain: &str) -> [u8; 16] {
    let key = ntlm_v1_password_func(password);
    hmac_md5(&key, &[&utf16_le(&username.to_uppercase()), &utf16_le(domain)])
}


/// Calculates the classic LMv1 and NTLMv1 responses to the given server challenge.
pub fn respond_challenge_ntlm_v1(server_challenge: [u8; 8], creds: &Credentials) -> ChallengeResponse {
    let nt_key = ntlm_v1_password_func(creds.password());
    let lm_key = lm_v1_password_func(creds.password());

    ChallengeResponse {
        lm_response: des_long(lm_key, server_challenge).to_vec(),
        nt_response: des_long(nt_key, server_challenge).to_vec(),
    }
}

/// Calculates an NTLMv1 response with a client challenge ("NTLM2 session response").
///
/// Used when the server negotiated extended session security. The LM response field carries the
/// random client challenge, which is mixed into the NT response through MD5.
pub fn respond_challenge_ntlm_v1_extended(server_challenge: [u8; 8], creds: &Credentials) -> ChallengeResponse {
    let nt_key = ntlm_v1_password_func(creds.password());
    ntlm_v1_extended_response(nt_key, server_challenge, random_client_challenge())
}

fn ntlm_v1_extended_response(nt_key: [u8; 16], server_challenge: [u8; 8], client_challenge: [u8; 8]) -> ChallengeResponse {
    let digest = Md5::new()
        .chain_update(server_challenge)
        .chain_update(client_challenge)
        .finalize();
    let mut session_nonce = [0u8; 8];
    session_nonce.copy_from_slice(&digest[..8]);

    let mut lm_response = client_challenge.to_vec();
    lm_response.resize(24, 0);

    ChallengeResponse {
        lm_response,
        nt_response: des_long(nt_key, session_nonce).to_vec(),
    }
}

/// Calculates the LMv2 and NTLMv2 responses to the given server challenge, including the
/// server's target information and a timestamp to protect against replay attacks.
pub fn respond_challenge_ntlm_v2(server_challenge: [u8; 8], target_info: &[u8], time: i64, creds: &Credentials) -> ChallengeResponse {
    let key = ntlm_v2_password_func(creds.password(), creds.username(), creds.domain());
    ntlm_v2_response(key, server_challenge, random_client_challenge(), target_info, time)
}

fn ntlm_v2_response(key: [u8; 16], server_challenge: [u8; 8], client_challenge: [u8; 8], target_info: &[u8], time: i64) -> ChallengeResponse {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.push(0x01); // response version
    blob.push(0x01); // highest response version
    blob.extend_from_slice(&[0; 6]);
    blob.extend_from_slice(&time.to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let nt_proof = hmac_md5(&key, &[&server_challenge, &blob]);
    let mut nt_response = nt_proof.to_vec();
    nt_response.extend_from_slice(&blob);

    let mut lm_response = hmac_md5(&key, &[&server_challenge, &client_challenge]).to_vec();
    lm_response.extend_from_slice(&client_challenge);

    ChallengeResponse {
        lm_response,
        nt_response,
    }
}
