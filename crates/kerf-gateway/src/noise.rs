//! Noise session: responder handshake and post-handshake frame ciphers.
//!
//! The gateway is the responder of a `Noise_XX_25519_AESGCM_SHA256`
//! handshake. Its first outbound handshake message carries the
//! JSON-serialized attestation document; every later handshake message
//! carries an empty payload. On completion the handshake splits into a
//! sealer (outbound) and an opener (inbound) so the writer and reader
//! tasks each own their direction, and the handshake state is dropped.

use kerf_core::{KerfError, KerfResult};
use std::sync::Arc;

/// Noise protocol name used on the wire.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256";

/// Maximum size of any Noise message, tag included.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Handshake frames above this size abort the session.
pub const MAX_HANDSHAKE_MESSAGE_SIZE: usize = 4096;

/// AES-GCM tag appended to every transport ciphertext.
pub const TAG_LEN: usize = 16;

/// Encrypts outbound transport frames. One instance per session,
/// owned by the outbound writer.
pub trait FrameSealer: Send {
    /// Encrypt one serialized frame; the ciphertext is frame length
    /// plus the 16-byte tag.
    fn seal(&mut self, frame: &[u8]) -> KerfResult<Vec<u8>>;
}

/// Decrypts inbound transport frames. One instance per session, owned
/// by the inbound reader.
pub trait FrameOpener: Send {
    fn open(&mut self, ciphertext: &[u8]) -> KerfResult<Vec<u8>>;
}

fn crypto_err(e: snow::Error) -> KerfError {
    KerfError::Crypto(e.to_string())
}

/// Responder-side handshake driver.
pub struct NoiseHandshake {
    state: snow::HandshakeState,
    attestation_payload: Vec<u8>,
    server_payload_sent: bool,
}

/// Result of feeding one inbound handshake message to the driver.
pub enum HandshakeProgress {
    /// More handshake messages are expected; send `responses` first.
    InProgress {
        responses: Vec<Vec<u8>>,
        handshake: NoiseHandshake,
    },
    /// The handshake completed; send `responses` (if any), then switch
    /// to the transport ciphers.
    Established {
        responses: Vec<Vec<u8>>,
        sealer: NoiseSealer,
        opener: NoiseOpener,
    },
}

impl NoiseHandshake {
    /// Create a responder handshake bound to the given static key,
    /// carrying `attestation_payload` in the first outbound message.
    pub fn responder(private_key: &[u8; 32], attestation_payload: Vec<u8>) -> KerfResult<Self> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| KerfError::Crypto(format!("noise pattern: {e}")))?;
        let state = snow::Builder::new(params)
            .local_private_key(private_key)
            .build_responder()
            .map_err(crypto_err)?;

        Ok(Self {
            state,
            attestation_payload,
            server_payload_sent: false,
        })
    }

    /// Consume one inbound handshake message and produce whatever the
    /// responder must send next. The driver takes ownership so the
    /// transient handshake state cannot outlive the split.
    pub fn advance(mut self, message: &[u8]) -> KerfResult<HandshakeProgress> {
        let mut payload_buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        self.state
            .read_message(message, &mut payload_buf)
            .map_err(|e| KerfError::Handshake(e.to_string()))?;

        let mut responses = Vec::new();
        while !self.state.is_handshake_finished() && self.state.is_my_turn() {
            let payload: &[u8] = if self.server_payload_sent {
                &[]
            } else {
                &self.attestation_payload
            };

            let mut out = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
            let len = self
                .state
                .write_message(payload, &mut out)
                .map_err(|e| KerfError::Handshake(e.to_string()))?;
            out.truncate(len);

            self.server_payload_sent = true;
            responses.push(out);
        }

        if self.state.is_handshake_finished() {
            let transport = Arc::new(
                self.state
                    .into_stateless_transport_mode()
                    .map_err(crypto_err)?,
            );
            Ok(HandshakeProgress::Established {
                responses,
                sealer: NoiseSealer::new(transport.clone()),
                opener: NoiseOpener::new(transport),
            })
        } else {
            Ok(HandshakeProgress::InProgress {
                responses,
                handshake: self,
            })
        }
    }
}

/// Outbound half of the transport cipher. The nonce counter advances
/// once per sealed frame; the stateless snow transport lets the two
/// directions live on different tasks.
pub struct NoiseSealer {
    transport: Arc<snow::StatelessTransportState>,
    nonce: u64,
}

impl NoiseSealer {
    fn new(transport: Arc<snow::StatelessTransportState>) -> Self {
        Self { transport, nonce: 0 }
    }
}

impl FrameSealer for NoiseSealer {
    fn seal(&mut self, frame: &[u8]) -> KerfResult<Vec<u8>> {
        let mut ciphertext = vec![0u8; frame.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(self.nonce, frame, &mut ciphertext)
            .map_err(crypto_err)?;
        ciphertext.truncate(len);
        self.nonce += 1;
        Ok(ciphertext)
    }
}

/// Inbound half of the transport cipher.
pub struct NoiseOpener {
    transport: Arc<snow::StatelessTransportState>,
    nonce: u64,
}

impl NoiseOpener {
    fn new(transport: Arc<snow::StatelessTransportState>) -> Self {
        Self { transport, nonce: 0 }
    }
}

impl FrameOpener for NoiseOpener {
    fn open(&mut self, ciphertext: &[u8]) -> KerfResult<Vec<u8>> {
        let mut frame = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(self.nonce, ciphertext, &mut frame)
            .map_err(crypto_err)?;
        frame.truncate(len);
        self.nonce += 1;
        Ok(frame)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{TagOpener, TagSealer};
    use super::*;

    fn responder_keypair() -> snow::Keypair {
        snow::Builder::new(NOISE_PATTERN.parse().unwrap())
            .generate_keypair()
            .unwrap()
    }

    fn client_initiator() -> snow::HandshakeState {
        let builder = snow::Builder::new(NOISE_PATTERN.parse().unwrap());
        let keys = builder.generate_keypair().unwrap();
        snow::Builder::new(NOISE_PATTERN.parse().unwrap())
            .local_private_key(&keys.private)
            .build_initiator()
            .unwrap()
    }

    /// Drive a full XX handshake; returns the established halves plus
    /// the client transport and the payload of the second message.
    fn establish() -> (
        NoiseSealer,
        NoiseOpener,
        snow::TransportState,
        Vec<u8>,
    ) {
        let server_keys = responder_keypair();
        let attestation = br#"{"platform":"TDX"}"#.to_vec();

        let mut client = client_initiator();
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE_SIZE];

        let server_private: [u8; 32] = server_keys.private.as_slice().try_into().unwrap();
        let handshake = NoiseHandshake::responder(&server_private, attestation).unwrap();

        // -> e
        let len = client.write_message(&[], &mut buf).unwrap();
        let progress = handshake.advance(&buf[..len]).unwrap();
        let (responses, handshake) = match progress {
            HandshakeProgress::InProgress {
                responses,
                handshake,
            } => (responses, handshake),
            HandshakeProgress::Established { .. } => panic!("established after one message"),
        };

        // <- e, ee, s, es (carrying the attestation payload)
        assert_eq!(responses.len(), 1);
        let payload_len = client.read_message(&responses[0], &mut payload).unwrap();
        let attestation_payload = payload[..payload_len].to_vec();

        // -> s, se
        let len = client.write_message(&[], &mut buf).unwrap();
        let progress = handshake.advance(&buf[..len]).unwrap();
        match progress {
            HandshakeProgress::Established {
                responses,
                sealer,
                opener,
            } => {
                assert!(responses.is_empty());
                let client_transport = client.into_transport_mode().unwrap();
                (sealer, opener, client_transport, attestation_payload)
            }
            HandshakeProgress::InProgress { .. } => panic!("handshake did not complete"),
        }
    }

    #[test]
    fn first_server_message_carries_attestation() {
        let (_, _, _, attestation_payload) = establish();
        assert_eq!(attestation_payload, br#"{"platform":"TDX"}"#);
    }

    #[test]
    fn sealed_frames_decrypt_on_the_client() {
        let (mut sealer, _, mut client, _) = establish();
        let frame = b"response frame bytes";

        let ciphertext = sealer.seal(frame).unwrap();
        assert_eq!(ciphertext.len(), frame.len() + TAG_LEN);

        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = client.read_message(&ciphertext, &mut plaintext).unwrap();
        assert_eq!(&plaintext[..len], frame);
    }

    #[test]
    fn client_frames_open_on_the_server() {
        let (_, mut opener, mut client, _) = establish();
        let frame = b"request frame bytes";

        let mut ciphertext = vec![0u8; frame.len() + TAG_LEN];
        let len = client.write_message(frame, &mut ciphertext).unwrap();
        ciphertext.truncate(len);

        assert_eq!(opener.open(&ciphertext).unwrap(), frame);
    }

    #[test]
    fn both_directions_interleave() {
        let (mut sealer, mut opener, mut client, _) = establish();
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];

        for i in 0..5u8 {
            let outbound = vec![i; 10];
            let ct = sealer.seal(&outbound).unwrap();
            let len = client.read_message(&ct, &mut buf).unwrap();
            assert_eq!(&buf[..len], outbound.as_slice());

            let inbound = vec![i ^ 0xff; 10];
            let len = client.write_message(&inbound, &mut buf).unwrap();
            assert_eq!(opener.open(&buf[..len]).unwrap(), inbound);
        }
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let (_, mut opener, mut client, _) = establish();
        let mut ciphertext = vec![0u8; 10 + TAG_LEN];
        let len = client.write_message(&[9u8; 10], &mut ciphertext).unwrap();
        ciphertext.truncate(len);
        ciphertext[0] ^= 0x01;

        assert!(matches!(
            opener.open(&ciphertext),
            Err(KerfError::Crypto(_))
        ));
    }

    #[test]
    fn garbage_handshake_message_fails() {
        let server_keys = responder_keypair();
        let server_private: [u8; 32] = server_keys.private.as_slice().try_into().unwrap();
        let handshake = NoiseHandshake::responder(&server_private, Vec::new()).unwrap();

        assert!(matches!(
            handshake.advance(&[0u8; 16]),
            Err(KerfError::Handshake(_))
        ));
    }

    #[test]
    fn fake_cipher_round_trips() {
        let mut sealer = TagSealer;
        let mut opener = TagOpener;
        let frame = b"frame";
        let ct = sealer.seal(frame).unwrap();
        assert_eq!(ct.len(), frame.len() + TAG_LEN);
        assert_eq!(opener.open(&ct).unwrap(), frame);
    }
}
