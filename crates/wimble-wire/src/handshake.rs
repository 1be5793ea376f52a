//! Connection handshake and record sealing.
//!
//! Both sides send a JSON [`Hello`] as their first record and then read the
//! other's. The hello carries the sender's public key, from which the remote
//! [`PeerId`] is derived.
//!
//! In [`SecurityMode::Secured`] the hello also carries an ephemeral X25519 key
//! signed with the sender's Ed25519 identity key. The X25519 shared secret is
//! expanded with HKDF-SHA256 into one AES-256-GCM key per direction, and every
//! later record body is sealed with a per-direction counter nonce.
//!
//! In [`SecurityMode::Insecure`] nothing is signed or encrypted: the remote id
//! is taken at face value. Both sides must agree on the mode.

use crate::error::{WireError, WireResult};
use crate::frame::{decode_length, encode_record, Frame, MAX_RECORD_SIZE};
use crate::identity::{Keypair, PeerId, PublicKey};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wimble_types::config::SecurityMode;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

/// Current handshake version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Domain separator for the ephemeral-key signature.
const SIGNATURE_CONTEXT: &[u8] = b"wimble-handshake:";
const DIALER_TO_LISTENER: &[u8] = b"wimble/dialer->listener";
const LISTENER_TO_DIALER: &[u8] = b"wimble/listener->dialer";

/// Which end of the TCP connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

/// First record sent by each side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub security: SecurityMode,
    /// Hex protobuf encoding of the identity key.
    pub public_key: String,
    /// Hex X25519 ephemeral key (secured mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key: Option<String>,
    /// Hex Ed25519 signature over the ephemeral key (secured mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// AES-256-GCM with a monotonically increasing 96-bit nonce.
pub(crate) struct RecordCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl RecordCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> WireResult<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| WireError::InvalidFrame("record nonce exhausted".into()))?;
        Ok(nonce)
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> WireResult<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::InvalidFrame("record encryption failed".into()))
    }

    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> WireResult<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| WireError::InvalidFrame("record authentication failed".into()))
    }
}

/// Reads length-prefixed records, unsealing them when a cipher is set.
pub(crate) struct RecordReader<R> {
    io: R,
    cipher: Option<RecordCipher>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    fn new(io: R) -> Self {
        Self { io, cipher: None }
    }

    /// Next record body, or `None` on a clean end of stream.
    async fn read_body(&mut self) -> WireResult<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.io.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = decode_length(&header);
        if len > MAX_RECORD_SIZE {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: MAX_RECORD_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await?;
        match &mut self.cipher {
            Some(cipher) => cipher.open(&body).map(Some),
            None => Ok(Some(body)),
        }
    }

    /// Next frame, or `None` when the remote closed the connection.
    pub(crate) async fn recv(&mut self) -> WireResult<Option<Frame>> {
        match self.read_body().await? {
            Some(body) => Frame::decode(&body).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes length-prefixed records, sealing them when a cipher is set.
pub(crate) struct RecordWriter<W> {
    io: W,
    cipher: Option<RecordCipher>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    fn new(io: W) -> Self {
        Self { io, cipher: None }
    }

    async fn write_body(&mut self, body: &[u8]) -> WireResult<()> {
        let record = match &mut self.cipher {
            Some(cipher) => encode_record(&cipher.seal(body)?),
            None => encode_record(body),
        };
        self.io.write_all(&record).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub(crate) async fn send(&mut self, frame: &Frame) -> WireResult<()> {
        self.write_body(&frame.encode()).await
    }

    /// Signal end of stream to the remote.
    pub(crate) async fn shutdown(&mut self) -> WireResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// An authenticated (or, in insecure mode, merely identified) connection.
pub(crate) struct Session<R, W> {
    pub remote_peer: PeerId,
    pub reader: RecordReader<R>,
    pub writer: RecordWriter<W>,
}

/// Run the handshake over the two halves of a fresh connection.
///
/// `expected` is the id the dialer believes it is talking to; a different key
/// on the other end fails the handshake.
pub(crate) async fn handshake<R, W>(
    reader: R,
    writer: W,
    keypair: &Keypair,
    security: SecurityMode,
    role: Role,
    expected: Option<&PeerId>,
) -> WireResult<Session<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = RecordReader::new(reader);
    let mut writer = RecordWriter::new(writer);

    let ephemeral = match security {
        SecurityMode::Secured => Some(EphemeralSecret::random_from_rng(OsRng)),
        SecurityMode::Insecure => None,
    };
    let ephemeral_public = ephemeral.as_ref().map(X25519Public::from);

    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        security,
        public_key: hex::encode(keypair.public().to_protobuf_encoding()),
        ephemeral_key: ephemeral_public.map(|pk| hex::encode(pk.as_bytes())),
        signature: ephemeral_public.map(|pk| hex::encode(keypair.sign(&signed_payload(pk.as_bytes())))),
    };
    writer.write_body(&serde_json::to_vec(&hello)?).await?;

    let body = reader
        .read_body()
        .await?
        .ok_or_else(|| WireError::Handshake("connection closed during handshake".into()))?;
    let remote: Hello = serde_json::from_slice(&body)
        .map_err(|e| WireError::Handshake(format!("invalid hello: {e}")))?;

    if remote.protocol_version != PROTOCOL_VERSION {
        return Err(WireError::Handshake(format!(
            "protocol version mismatch: local={PROTOCOL_VERSION}, remote={}",
            remote.protocol_version
        )));
    }
    if remote.security != security {
        return Err(WireError::Handshake(format!(
            "security mode mismatch: local={security}, remote={}",
            remote.security
        )));
    }

    let remote_key = PublicKey::from_protobuf_encoding(&decode_hex("public_key", &remote.public_key)?)?;
    let remote_peer = remote_key.to_peer_id();
    if let Some(expected) = expected {
        if *expected != remote_peer {
            return Err(WireError::Handshake(format!(
                "remote identity mismatch: expected {expected}, got {remote_peer}"
            )));
        }
    }

    if let (Some(ephemeral), Some(local_public)) = (ephemeral, ephemeral_public) {
        let remote_ephemeral = remote
            .ephemeral_key
            .as_deref()
            .ok_or_else(|| WireError::Handshake("missing ephemeral key".into()))?;
        let remote_ephemeral: [u8; 32] = decode_hex("ephemeral_key", remote_ephemeral)?
            .try_into()
            .map_err(|_| WireError::Handshake("ephemeral key must be 32 bytes".into()))?;
        let signature = remote
            .signature
            .as_deref()
            .ok_or_else(|| WireError::Handshake("missing signature".into()))?;
        if !remote_key.verify(&signed_payload(&remote_ephemeral), &decode_hex("signature", signature)?) {
            return Err(WireError::Handshake(format!(
                "signature from {remote_peer} does not verify"
            )));
        }

        let shared = ephemeral.diffie_hellman(&X25519Public::from(remote_ephemeral));
        if !shared.was_contributory() {
            return Err(WireError::Handshake("non-contributory key exchange".into()));
        }

        let (dialer_eph, listener_eph) = match role {
            Role::Dialer => (*local_public.as_bytes(), remote_ephemeral),
            Role::Listener => (remote_ephemeral, *local_public.as_bytes()),
        };
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(&dialer_eph);
        salt.extend_from_slice(&listener_eph);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut dialer_key = Zeroizing::new([0u8; 32]);
        let mut listener_key = Zeroizing::new([0u8; 32]);
        hk.expand(DIALER_TO_LISTENER, &mut *dialer_key)
            .and_then(|_| hk.expand(LISTENER_TO_DIALER, &mut *listener_key))
            .map_err(|e| WireError::Handshake(format!("key derivation failed: {e}")))?;

        let (send_key, recv_key) = match role {
            Role::Dialer => (&dialer_key, &listener_key),
            Role::Listener => (&listener_key, &dialer_key),
        };
        writer.cipher = Some(RecordCipher::new(send_key));
        reader.cipher = Some(RecordCipher::new(recv_key));
    }

    Ok(Session {
        remote_peer,
        reader,
        writer,
    })
}

fn signed_payload(ephemeral: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 32);
    payload.extend_from_slice(SIGNATURE_CONTEXT);
    payload.extend_from_slice(ephemeral);
    payload
}

fn decode_hex(field: &str, value: &str) -> WireResult<Vec<u8>> {
    hex::decode(value).map_err(|e| WireError::Handshake(format!("invalid {field}: {e}")))
}
