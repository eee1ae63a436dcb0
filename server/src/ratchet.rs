//! Double-ratchet key derivation and envelope sealing for end-to-end sessions.
//!
//! One [`RatchetState`] is held per peer. `initialize` performs the initial
//! X25519 handshake and derives two *distinct* chain keys from the shared
//! secret — never the same value in both the send and receive slot, even
//! though both peers start from the same DH output — so that a DH-ratchet
//! step is required before either side can read back its own history.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::VecDeque;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("ratchet not initialized")]
    NotInitialized,
    #[error("replayed or stale counter")]
    Replay,
    #[error("skipped-key limit exceeded")]
    SkippedLimitExceeded,
    #[error("AEAD authentication failed")]
    DecryptAuthFailed,
    #[error("state deserialization failed: {0}")]
    Serialization(&'static str),
    #[error("state MAC verification failed")]
    MacMismatch,
}

pub type Result<T> = std::result::Result<T, RatchetError>;

/// X25519 key-agreement keypair.
pub fn generate_key_agreement_keypair() -> (PublicKey, StaticSecret) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public, secret)
}

/// HKDF-Extract(salt=∅, IKM=shared) then HKDF-Expand with labels `"root"`/`"chain"`.
pub fn perform_handshake(local_sec: &StaticSecret, remote_pub: &PublicKey) -> ([u8; 32], [u8; 32]) {
    let shared = local_sec.diffie_hellman(remote_pub);
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    hkdf.expand(b"root", &mut root_key).expect("32 <= 255*32");
    hkdf.expand(b"chain", &mut chain_key).expect("32 <= 255*32");
    (root_key, chain_key)
}

#[derive(Clone)]
struct ChainState {
    key: [u8; 32],
    counter: u64,
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct SkippedKey {
    public_key: [u8; 32],
    counter: u64,
    message_key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetHeader {
    pub public_key: [u8; 32],
    pub counter: u64,
    pub previous_counter: u64,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub header: RatchetHeader,
}

/// Per-peer ratchet state. Not `Clone`: two independently-evolving copies of
/// the same session would violate the single-writer invariant on the chains.
pub struct RatchetState {
    root_key: [u8; 32],
    send_chain: Option<ChainState>,
    recv_chain: Option<ChainState>,
    local_public: PublicKey,
    local_secret: StaticSecret,
    remote_public: Option<PublicKey>,
    skipped: VecDeque<SkippedKey>,
    max_skipped: usize,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl RatchetState {
    /// Establishes a session from a completed handshake. `is_initiator`
    /// decides which of the two HKDF-derived chains becomes this peer's
    /// send chain; the initiator's send chain is the responder's receive
    /// chain and vice versa, so the two keys must differ even though both
    /// sides derive them from the identical DH output.
    pub fn initialize(
        local_keypair: (PublicKey, StaticSecret),
        remote_pub: PublicKey,
        is_initiator: bool,
        max_skipped: usize,
    ) -> Self {
        let (local_public, local_secret) = local_keypair;
        let shared = local_secret.diffie_hellman(&remote_pub);
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

        let mut root_key = [0u8; 32];
        let mut chain_a = [0u8; 32]; // "chain-send" label
        let mut chain_b = [0u8; 32]; // "chain-recv" label
        hkdf.expand(b"root", &mut root_key).expect("32 <= 255*32");
        hkdf.expand(b"chain-send", &mut chain_a).expect("32 <= 255*32");
        hkdf.expand(b"chain-recv", &mut chain_b).expect("32 <= 255*32");

        let (send_key, recv_key) = if is_initiator {
            (chain_a, chain_b)
        } else {
            (chain_b, chain_a)
        };

        RatchetState {
            root_key,
            send_chain: Some(ChainState { key: send_key, counter: 0 }),
            recv_chain: Some(ChainState { key: recv_key, counter: 0 }),
            local_public,
            local_secret,
            remote_public: Some(remote_pub),
            skipped: VecDeque::new(),
            max_skipped,
        }
    }

    pub fn local_public_key(&self) -> PublicKey {
        self.local_public
    }

    /// Derive `(messageKey, nextChain)` from a chain key via HMAC-labeled
    /// HKDF-Expand; message key and next chain key are domain-separated.
    fn chain_kdf(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let hkdf = Hkdf::<Sha256>::new(None, chain_key);
        let mut next_chain = [0u8; 32];
        let mut message_key = [0u8; 32];
        hkdf.expand(b"message", &mut message_key).expect("32 <= 255*32");
        hkdf.expand(b"chain-next", &mut next_chain).expect("32 <= 255*32");
        (message_key, next_chain)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        use chacha20poly1305::aead::{Aead, KeyInit, Payload};
        use chacha20poly1305::{XChaCha20Poly1305, XNonce};

        let send = self.send_chain.as_ref().ok_or(RatchetError::NotInitialized)?;
        let (message_key, next_chain) = Self::chain_kdf(&send.key);
        let counter = send.counter + 1;
        let recv_counter = self.recv_chain.as_ref().map(|c| c.counter).unwrap_or(0);

        self.send_chain = Some(ChainState { key: next_chain, counter });

        let header = RatchetHeader {
            public_key: self.local_public.to_bytes(),
            counter,
            previous_counter: recv_counter,
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = XChaCha20Poly1305::new((&message_key).into());
        let aad = header_bytes(&header);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| RatchetError::DecryptAuthFailed)?;

        Ok(Envelope { nonce: nonce_bytes, ciphertext, header })
    }

    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        // 1. Skipped-key fast path: a counter we've already advanced past.
        let recv_counter = self.recv_chain.as_ref().map(|c| c.counter).unwrap_or(0);
        if envelope.header.counter <= recv_counter
            && Some(envelope.header.public_key) == self.remote_public.map(|p| p.to_bytes())
        {
            return self.try_skipped(envelope);
        }

        // 2. New remote ratchet key => perform a DH-ratchet step.
        let remote_changed = self.remote_public.map(|p| p.to_bytes()) != Some(envelope.header.public_key);
        if remote_changed {
            if self.remote_public.is_some() {
                self.skip_to(envelope.header.previous_counter)?;
            }
            self.dh_ratchet_step(envelope.header.public_key)?;
        }

        // 3. Advance recv chain up to counter-1, stashing intermediate keys.
        self.skip_to(envelope.header.counter.saturating_sub(1))?;

        let recv = self.recv_chain.as_ref().ok_or(RatchetError::NotInitialized)?;
        let (message_key, next_chain) = Self::chain_kdf(&recv.key);
        let new_counter = recv.counter.max(envelope.header.counter);
        self.recv_chain = Some(ChainState { key: next_chain, counter: new_counter });

        self.open_with_key(&message_key, envelope)
    }

    fn open_with_key(&self, message_key: &[u8; 32], envelope: &Envelope) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, KeyInit, Payload};
        use chacha20poly1305::{XChaCha20Poly1305, XNonce};

        let cipher = XChaCha20Poly1305::new(message_key.into());
        let aad = header_bytes(&envelope.header);
        cipher
            .decrypt(
                XNonce::from_slice(&envelope.nonce),
                Payload { msg: &envelope.ciphertext, aad: &aad },
            )
            .map_err(|_| RatchetError::DecryptAuthFailed)
    }

    fn try_skipped(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        let idx = self.skipped.iter().position(|sk| {
            sk.public_key == envelope.header.public_key && sk.counter == envelope.header.counter
        });
        match idx {
            Some(i) => {
                let sk = self.skipped.remove(i).expect("index from position()");
                self.open_with_key(&sk.message_key, envelope)
            }
            None => Err(RatchetError::Replay),
        }
    }

    /// Advances the receive chain up to (and storing) counter `until`,
    /// without consuming the key for `until+1` itself.
    fn skip_to(&mut self, until: u64) -> Result<()> {
        let recv = match self.recv_chain.as_mut() {
            Some(r) => r,
            None => return Ok(()),
        };
        let remote_pub = self.remote_public.map(|p| p.to_bytes()).unwrap_or([0u8; 32]);
        let to_skip = until.saturating_sub(recv.counter);
        if to_skip == 0 {
            return Ok(());
        }
        if self.max_skipped == 0 || to_skip as usize > self.max_skipped {
            return Err(RatchetError::SkippedLimitExceeded);
        }

        let mut key = recv.key;
        let mut counter = recv.counter;
        for _ in 0..to_skip {
            let (message_key, next_key) = Self::chain_kdf(&key);
            counter += 1;
            self.skipped.push_back(SkippedKey { public_key: remote_pub, counter, message_key });
            key = next_key;
        }
        recv.key = key;
        recv.counter = counter;

        while self.skipped.len() > self.max_skipped {
            self.skipped.pop_front();
        }
        Ok(())
    }

    fn dh_ratchet_step(&mut self, remote_pub_bytes: [u8; 32]) -> Result<()> {
        let remote_pub = PublicKey::from(remote_pub_bytes);
        self.remote_public = Some(remote_pub);
        self.skipped.clear();

        let dh_recv = self.local_secret.diffie_hellman(&remote_pub);
        let hkdf = Hkdf::<Sha256>::new(Some(&self.root_key), dh_recv.as_bytes());
        let mut new_root = [0u8; 32];
        let mut recv_key = [0u8; 32];
        hkdf.expand(b"dh", &mut new_root).expect("32 <= 255*32");
        hkdf.expand(b"chain-recv", &mut recv_key).expect("32 <= 255*32");
        self.root_key = new_root;
        self.recv_chain = Some(ChainState { key: recv_key, counter: 0 });

        let (new_local_public, new_local_secret) = generate_key_agreement_keypair();
        self.local_public = new_local_public;
        self.local_secret = new_local_secret;

        let dh_send = self.local_secret.diffie_hellman(&remote_pub);
        let hkdf2 = Hkdf::<Sha256>::new(Some(&self.root_key), dh_send.as_bytes());
        let mut new_root2 = [0u8; 32];
        let mut send_key = [0u8; 32];
        hkdf2.expand(b"dh", &mut new_root2).expect("32 <= 255*32");
        hkdf2.expand(b"chain-send", &mut send_key).expect("32 <= 255*32");
        self.root_key = new_root2;
        self.send_chain = Some(ChainState { key: send_key, counter: 0 });

        Ok(())
    }

    /// Deterministic, length-prefixed serialization plus an HMAC-SHA256 tag
    /// over the payload keyed by `rootKey`. Verified in constant time on load.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_field(&mut buf, &self.root_key);
        write_chain(&mut buf, &self.send_chain);
        write_chain(&mut buf, &self.recv_chain);
        write_field(&mut buf, self.local_public.as_bytes());
        write_field(&mut buf, self.local_secret.to_bytes().as_slice());
        match self.remote_public {
            Some(p) => {
                buf.push(1);
                write_field(&mut buf, p.as_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(self.max_skipped as u32).to_be_bytes());

        let mut mac = HmacSha256::new_from_slice(&self.root_key).expect("HMAC accepts any key length");
        mac.update(&buf);
        let tag = mac.finalize().into_bytes();
        buf.extend_from_slice(&tag);
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 32 {
            return Err(RatchetError::Serialization("truncated"));
        }
        let (payload, tag) = bytes.split_at(bytes.len() - 32);
        let mut cursor = 0usize;
        let root_key: [u8; 32] = read_field(payload, &mut cursor)?;

        let mut mac = HmacSha256::new_from_slice(&root_key).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| RatchetError::MacMismatch)?;

        let send_chain = read_chain(payload, &mut cursor)?;
        let recv_chain = read_chain(payload, &mut cursor)?;
        let local_public_bytes: [u8; 32] = read_field(payload, &mut cursor)?;
        let local_secret_bytes: [u8; 32] = read_field(payload, &mut cursor)?;
        let has_remote = *payload.get(cursor).ok_or(RatchetError::Serialization("eof"))?;
        cursor += 1;
        let remote_public = if has_remote == 1 {
            let bytes: [u8; 32] = read_field(payload, &mut cursor)?;
            Some(PublicKey::from(bytes))
        } else {
            None
        };
        let max_skipped_bytes: [u8; 4] = payload
            .get(cursor..cursor + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or(RatchetError::Serialization("eof"))?;
        let max_skipped = u32::from_be_bytes(max_skipped_bytes) as usize;

        Ok(RatchetState {
            root_key,
            send_chain,
            recv_chain,
            local_public: PublicKey::from(local_public_bytes),
            local_secret: StaticSecret::from(local_secret_bytes),
            remote_public,
            skipped: VecDeque::new(),
            max_skipped,
        })
    }
}

fn header_bytes(header: &RatchetHeader) -> Vec<u8> {
    let mut v = Vec::with_capacity(32 + 16);
    v.extend_from_slice(&header.public_key);
    v.extend_from_slice(&header.counter.to_be_bytes());
    v.extend_from_slice(&header.previous_counter.to_be_bytes());
    v
}

fn write_field(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn write_chain(buf: &mut Vec<u8>, chain: &Option<ChainState>) {
    match chain {
        Some(c) => {
            buf.push(1);
            write_field(buf, &c.key);
            buf.extend_from_slice(&c.counter.to_be_bytes());
        }
        None => buf.push(0),
    }
}

fn read_field<const N: usize>(payload: &[u8], cursor: &mut usize) -> Result<[u8; N]> {
    let len_bytes = payload
        .get(*cursor..*cursor + 4)
        .ok_or(RatchetError::Serialization("eof"))?;
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    *cursor += 4;
    if len != N {
        return Err(RatchetError::Serialization("field length mismatch"));
    }
    let data = payload
        .get(*cursor..*cursor + len)
        .ok_or(RatchetError::Serialization("eof"))?;
    *cursor += len;
    data.try_into().map_err(|_| RatchetError::Serialization("field length mismatch"))
}

fn read_chain(payload: &[u8], cursor: &mut usize) -> Result<Option<ChainState>> {
    let tag = *payload.get(*cursor).ok_or(RatchetError::Serialization("eof"))?;
    *cursor += 1;
    if tag == 0 {
        return Ok(None);
    }
    let key: [u8; 32] = read_field(payload, cursor)?;
    let counter_bytes = payload
        .get(*cursor..*cursor + 8)
        .ok_or(RatchetError::Serialization("eof"))?;
    let counter = u64::from_be_bytes(counter_bytes.try_into().unwrap());
    *cursor += 8;
    Ok(Some(ChainState { key, counter }))
}
