//! NTLMv2 client: the three handshake messages and the session security
//! used to seal WinRM traffic on plain HTTP listeners.

use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest, Md5};
use rand::RngCore;
use rc4::consts::U16;
use rc4::{KeyInit, Rc4, StreamCipher};
use thiserror::Error;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const TYPE_NEGOTIATE: u32 = 1;
const TYPE_CHALLENGE: u32 = 2;
const TYPE_AUTHENTICATE: u32 = 3;

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_SEAL: u32 = 0x0000_0020;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_SEAL
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

// Windows 10, build 19041, NTLMSSP revision 15.
const VERSION: [u8; 8] = [10, 0, 0x61, 0x4a, 0, 0, 0, 0x0f];

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

const CLIENT_SIGNING: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING: &[u8] = b"session key to server-to-client sealing key magic constant\0";

// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtlmError {
    #[error("malformed NTLM challenge: {0}")]
    MalformedChallenge(&'static str),
    #[error("server did not agree to NTLMv2 session security")]
    WeakSession,
    #[error("invalid NTLM key material")]
    InvalidKey,
    #[error("sealed message signature does not verify")]
    BadSignature,
}

/// Account used for the handshake. `DOMAIN\user` names are split; anything
/// else is sent as the user name with an empty domain.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub domain: String,
    password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        let (domain, user) = match username.split_once('\\') {
            Some((domain, user)) => (domain.to_string(), user.to_string()),
            None => (String::new(), username.to_string()),
        };
        Self {
            user,
            domain,
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("password", &"***")
            .finish()
    }
}

pub fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(40);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&TYPE_NEGOTIATE.to_le_bytes());
    message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    // Empty domain and workstation fields.
    message.extend_from_slice(&[0; 16]);
    message.extend_from_slice(&VERSION);
    message
}

/// Answers a challenge with an authenticate message and returns the session
/// security the rest of the connection is sealed with.
pub fn authenticate(
    credentials: &Credentials,
    challenge: &[u8],
) -> Result<(Vec<u8>, SessionSecurity), NtlmError> {
    let mut rng = rand::thread_rng();
    let mut client_challenge = [0u8; 8];
    rng.fill_bytes(&mut client_challenge);
    let mut session_key = [0u8; 16];
    rng.fill_bytes(&mut session_key);
    authenticate_with(
        credentials,
        challenge,
        client_challenge,
        session_key,
        filetime_now(),
    )
}

fn authenticate_with(
    credentials: &Credentials,
    challenge: &[u8],
    client_challenge: [u8; 8],
    random_session_key: [u8; 16],
    now: u64,
) -> Result<(Vec<u8>, SessionSecurity), NtlmError> {
    let challenge = Challenge::parse(challenge)?;
    let flags = challenge.flags;
    if flags & NEGOTIATE_EXTENDED_SESSION_SECURITY == 0 || flags & NEGOTIATE_128 == 0 {
        return Err(NtlmError::WeakSession);
    }

    let response_key = ntowf_v2(credentials)?;
    let server_timestamp = challenge.timestamp();

    let mut blob = vec![1, 1, 0, 0, 0, 0, 0, 0];
    blob.extend_from_slice(&server_timestamp.unwrap_or(now).to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(challenge.target_info);
    blob.extend_from_slice(&[0; 4]);

    let nt_proof = hmac_md5(&response_key, &[&challenge.server_challenge, &blob])?;
    let mut nt_response = nt_proof.to_vec();
    nt_response.extend_from_slice(&blob);

    let lm_response = if server_timestamp.is_some() {
        vec![0; 24]
    } else {
        let mut lm = hmac_md5(
            &response_key,
            &[&challenge.server_challenge, &client_challenge],
        )?
        .to_vec();
        lm.extend_from_slice(&client_challenge);
        lm
    };

    let session_base_key = hmac_md5(&response_key, &[&nt_proof])?;
    let key_exchange = flags & NEGOTIATE_KEY_EXCH != 0;
    let (exported_key, encrypted_key) = if key_exchange {
        let mut encrypted = random_session_key;
        rc4(&session_base_key)?.apply_keystream(&mut encrypted);
        (random_session_key, encrypted.to_vec())
    } else {
        (session_base_key, Vec::new())
    };

    let message = authenticate_message(
        flags,
        &[
            &lm_response,
            &nt_response,
            &utf16(&credentials.domain),
            &utf16(&credentials.user),
            &[],
            &encrypted_key,
        ],
    );
    let session = SessionSecurity::new(&exported_key, key_exchange, Role::Client)?;
    Ok((message, session))
}

fn authenticate_message(flags: u32, fields: &[&[u8]; 6]) -> Vec<u8> {
    const HEADER_LEN: usize = 8 + 4 + 6 * 8 + 4 + 8;
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(SIGNATURE);
    header.extend_from_slice(&TYPE_AUTHENTICATE.to_le_bytes());

    let mut payload = Vec::new();
    for field in fields {
        let offset = (HEADER_LEN + payload.len()) as u32;
        let len = field.len() as u16;
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(field);
    }
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&VERSION);
    header.extend_from_slice(&payload);
    header
}

struct Challenge<'a> {
    flags: u32,
    server_challenge: [u8; 8],
    target_info: &'a [u8],
}

impl<'a> Challenge<'a> {
    fn parse(message: &'a [u8]) -> Result<Self, NtlmError> {
        if message.len() < 32 || &message[..8] != SIGNATURE {
            return Err(NtlmError::MalformedChallenge("missing NTLMSSP signature"));
        }
        if read_u32(message, 8) != Some(TYPE_CHALLENGE) {
            return Err(NtlmError::MalformedChallenge("not a challenge message"));
        }
        let flags = read_u32(message, 20).ok_or(NtlmError::MalformedChallenge("truncated"))?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&message[24..32]);

        let target_info = if message.len() >= 48 {
            let len = read_u16(message, 40).unwrap_or(0) as usize;
            let offset = read_u32(message, 44).unwrap_or(0) as usize;
            message
                .get(offset..offset + len)
                .ok_or(NtlmError::MalformedChallenge("target info out of bounds"))?
        } else {
            &[]
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    fn timestamp(&self) -> Option<u64> {
        let mut cursor = 0;
        while let (Some(id), Some(len)) = (
            read_u16(self.target_info, cursor),
            read_u16(self.target_info, cursor + 2),
        ) {
            let value = self.target_info.get(cursor + 4..cursor + 4 + len as usize)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if value.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(value);
                    return Some(u64::from_le_bytes(raw));
                }
                _ => cursor += 4 + len as usize,
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    #[cfg_attr(not(test), allow(dead_code))]
    Server,
}

/// Per-connection sealing state. Each direction keeps its own RC4 stream
/// and sequence number, so messages must be sealed and unsealed in order.
pub struct SessionSecurity {
    key_exchange: bool,
    outgoing_signing: [u8; 16],
    incoming_signing: [u8; 16],
    outgoing: Rc4<U16>,
    incoming: Rc4<U16>,
    outgoing_seq: u32,
    incoming_seq: u32,
}

impl SessionSecurity {
    pub(crate) fn new(
        exported_key: &[u8; 16],
        key_exchange: bool,
        role: Role,
    ) -> Result<Self, NtlmError> {
        let client_signing = md5(&[exported_key, CLIENT_SIGNING]);
        let server_signing = md5(&[exported_key, SERVER_SIGNING]);
        let client_sealing = rc4(&md5(&[exported_key, CLIENT_SEALING]))?;
        let server_sealing = rc4(&md5(&[exported_key, SERVER_SEALING]))?;

        let (outgoing_signing, incoming_signing, outgoing, incoming) = match role {
            Role::Client => (client_signing, server_signing, client_sealing, server_sealing),
            Role::Server => (server_signing, client_signing, server_sealing, client_sealing),
        };
        Ok(Self {
            key_exchange,
            outgoing_signing,
            incoming_signing,
            outgoing,
            incoming,
            outgoing_seq: 0,
            incoming_seq: 0,
        })
    }

    /// Encrypts `message` and returns `(signature, sealed)`.
    pub fn seal(&mut self, message: &[u8]) -> Result<([u8; 16], Vec<u8>), NtlmError> {
        let mut sealed = message.to_vec();
        self.outgoing.apply_keystream(&mut sealed);
        let signature = sign(
            &self.outgoing_signing,
            &mut self.outgoing,
            self.key_exchange,
            self.outgoing_seq,
            message,
        )?;
        self.outgoing_seq = self.outgoing_seq.wrapping_add(1);
        Ok((signature, sealed))
    }

    pub fn unseal(&mut self, sealed: &[u8], signature: &[u8]) -> Result<Vec<u8>, NtlmError> {
        let mut message = sealed.to_vec();
        self.incoming.apply_keystream(&mut message);
        let expected = sign(
            &self.incoming_signing,
            &mut self.incoming,
            self.key_exchange,
            self.incoming_seq,
            &message,
        )?;
        if signature != expected.as_slice() {
            return Err(NtlmError::BadSignature);
        }
        self.incoming_seq = self.incoming_seq.wrapping_add(1);
        Ok(message)
    }
}

fn sign(
    signing_key: &[u8; 16],
    handle: &mut Rc4<U16>,
    key_exchange: bool,
    seq: u32,
    message: &[u8],
) -> Result<[u8; 16], NtlmError> {
    let mac = hmac_md5(signing_key, &[&seq.to_le_bytes(), message])?;
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&mac[..8]);
    if key_exchange {
        handle.apply_keystream(&mut checksum);
    }

    let mut signature = [0u8; 16];
    signature[..4].copy_from_slice(&1u32.to_le_bytes());
    signature[4..12].copy_from_slice(&checksum);
    signature[12..].copy_from_slice(&seq.to_le_bytes());
    Ok(signature)
}

fn ntowf_v2(credentials: &Credentials) -> Result<[u8; 16], NtlmError> {
    let nt_hash: [u8; 16] = Md4::digest(utf16(&credentials.password)).into();
    let identity = format!("{}{}", credentials.user.to_uppercase(), credentials.domain);
    hmac_md5(&nt_hash, &[&utf16(&identity)])
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], NtlmError> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(|_| NtlmError::InvalidKey)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn rc4(key: &[u8; 16]) -> Result<Rc4<U16>, NtlmError> {
    <Rc4<U16> as KeyInit>::new_from_slice(key).map_err(|_| NtlmError::InvalidKey)
}

fn utf16(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn filetime_now() -> u64 {
    let unix_nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    FILETIME_UNIX_EPOCH + (unix_nanos / 100).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // Values from the NTLMv2 authentication example in MS-NLMP 4.2.4.
    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];
    const RANDOM_SESSION_KEY: [u8; 16] = [0x55; 16];
    const FLAGS: u32 = 0xe28a_8233;

    fn hex(value: &str) -> Vec<u8> {
        value
            .split_whitespace()
            .map(|byte| u8::from_str_radix(byte, 16).expect("hex byte"))
            .collect()
    }

    fn target_info() -> Vec<u8> {
        let mut info = Vec::new();
        for (id, value) in [(2u16, "Domain"), (1u16, "Server")] {
            let value = utf16(value);
            info.extend_from_slice(&id.to_le_bytes());
            info.extend_from_slice(&(value.len() as u16).to_le_bytes());
            info.extend_from_slice(&value);
        }
        info.extend_from_slice(&[0; 4]);
        info
    }

    fn challenge_message(flags: u32, target_info: &[u8]) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&TYPE_CHALLENGE.to_le_bytes());
        message.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
        message.extend_from_slice(&flags.to_le_bytes());
        message.extend_from_slice(&SERVER_CHALLENGE);
        message.extend_from_slice(&[0; 8]);
        let len = target_info.len() as u16;
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(&48u32.to_le_bytes());
        message.extend_from_slice(target_info);
        message
    }

    fn field(message: &[u8], index: usize) -> &[u8] {
        let at = 12 + index * 8;
        let len = read_u16(message, at).expect("length") as usize;
        let offset = read_u32(message, at + 4).expect("offset") as usize;
        &message[offset..offset + len]
    }

    fn credentials() -> Credentials {
        Credentials::new("Domain\\User", "Password")
    }

    #[test]
    fn splits_domain_from_user() {
        let creds = credentials();
        assert_eq!(creds.domain, "Domain");
        assert_eq!(creds.user, "User");
        let upn = Credentials::new("user@corp.example", "pw");
        assert_eq!(upn.domain, "");
        assert_eq!(upn.user, "user@corp.example");
        assert!(!format!("{upn:?}").contains("pw\""));
    }

    #[test]
    fn response_key_matches_reference() {
        assert_eq!(
            ntowf_v2(&credentials()).expect("key").to_vec(),
            hex("0c 86 8a 40 3b fd 7a 93 a3 00 1e f2 2e f0 2e 3f")
        );
    }

    #[test]
    fn authenticate_message_matches_reference() {
        let challenge = challenge_message(FLAGS, &target_info());
        let (message, _) = authenticate_with(
            &credentials(),
            &challenge,
            CLIENT_CHALLENGE,
            RANDOM_SESSION_KEY,
            0,
        )
        .expect("authenticate");

        assert_eq!(&message[..8], SIGNATURE);
        assert_eq!(read_u32(&message, 8), Some(TYPE_AUTHENTICATE));
        assert_eq!(read_u32(&message, 60), Some(FLAGS));
        assert_eq!(
            field(&message, 1)[..16].to_vec(),
            hex("68 cd 0a b8 51 e5 1c 96 aa bc 92 7b eb ef 6a 1c")
        );
        assert_eq!(
            field(&message, 5).to_vec(),
            hex("c5 da d2 54 4f c9 79 90 94 ce 1c e9 0b c9 d0 3e")
        );
        assert_eq!(field(&message, 2).to_vec(), utf16("Domain"));
        assert_eq!(field(&message, 3).to_vec(), utf16("User"));
        assert!(field(&message, 4).is_empty());
    }

    #[test]
    fn seals_like_the_reference_client() {
        let challenge = challenge_message(FLAGS, &target_info());
        let (_, mut session) = authenticate_with(
            &credentials(),
            &challenge,
            CLIENT_CHALLENGE,
            RANDOM_SESSION_KEY,
            0,
        )
        .expect("authenticate");

        let (signature, sealed) = session.seal(&utf16("Plaintext")).expect("seal");
        assert_eq!(
            sealed,
            hex("54 e5 01 65 bf 19 36 dc 99 60 20 c1 81 1b 0f 06 fb 5f")
        );
        assert_eq!(
            signature.to_vec(),
            hex("01 00 00 00 7f b3 8e c5 c5 5d 49 76 00 00 00 00")
        );
    }

    #[test]
    fn server_messages_unseal_in_sequence() {
        let mut client =
            SessionSecurity::new(&RANDOM_SESSION_KEY, true, Role::Client).expect("client");
        let mut server =
            SessionSecurity::new(&RANDOM_SESSION_KEY, true, Role::Server).expect("server");

        for body in ["first reply", "second reply"] {
            let (signature, sealed) = server.seal(body.as_bytes()).expect("seal");
            let plain = client.unseal(&sealed, &signature).expect("unseal");
            assert_eq!(plain, body.as_bytes());
        }

        let (mut signature, sealed) = server.seal(b"tampered").expect("seal");
        signature[5] ^= 0xff;
        assert_eq!(
            client.unseal(&sealed, &signature),
            Err(NtlmError::BadSignature)
        );
    }

    #[test]
    fn server_timestamp_replaces_lm_response() {
        let mut info = 7u16.to_le_bytes().to_vec();
        info.extend_from_slice(&8u16.to_le_bytes());
        info.extend_from_slice(&0x01d9_0000_0000_0000u64.to_le_bytes());
        info.extend_from_slice(&[0; 4]);
        let challenge = challenge_message(FLAGS, &info);

        let (message, _) = authenticate_with(
            &credentials(),
            &challenge,
            CLIENT_CHALLENGE,
            RANDOM_SESSION_KEY,
            1,
        )
        .expect("authenticate");
        assert_eq!(field(&message, 0).to_vec(), vec![0; 24]);
        let blob = &field(&message, 1)[16..];
        assert_eq!(blob[8..16], 0x01d9_0000_0000_0000u64.to_le_bytes());
    }

    #[test]
    fn rejects_servers_without_extended_session_security() {
        let challenge = challenge_message(FLAGS & !NEGOTIATE_EXTENDED_SESSION_SECURITY, &[]);
        assert!(matches!(
            authenticate_with(&credentials(), &challenge, CLIENT_CHALLENGE, RANDOM_SESSION_KEY, 0),
            Err(NtlmError::WeakSession)
        ));
        assert!(matches!(
            authenticate(&credentials(), b"NTLMSSP\0garbage"),
            Err(NtlmError::MalformedChallenge(_))
        ));
    }

    #[test]
    fn negotiate_message_advertises_sealing() {
        let message = negotiate_message();
        assert_eq!(message.len(), 40);
        let flags = read_u32(&message, 12).expect("flags");
        assert_ne!(flags & NEGOTIATE_SEAL, 0);
        assert_ne!(flags & NEGOTIATE_KEY_EXCH, 0);
    }
}
