//! Noise_NK_25519_ChaChaPoly_BLAKE2b transport wrapper (§4.4). Grounded on
//! `protocols/noise/src/xx.rs`'s `InboundState`/`OutboundState` handshake
//! state machine -- adapted from Noise XX's three-message pattern to NK's
//! two-message one -- and on `original_source/theseus/noisewrapper.py`'s
//! length/payload record alternation and write-before-handshake queueing.
//!
//! Unlike `xx.rs`, which hand-rolls `Future::poll` over a raw
//! `AsyncRead`/`AsyncWrite`, this wrapper drives the same state sequence
//! with `async`/`await` inside a dedicated per-connection task -- matching
//! how the rest of this crate uses `async-std` rather than the legacy
//! futures-0.1 machinery `xx.rs` was written against. The state enum and
//! its `S0 -> S1 -> S2` transitions are kept explicit so the mapping back
//! to the original's state machine stays obvious.

use crate::error::TransportError;
use async_std::channel::{unbounded, Receiver, Sender};
use async_std::net::TcpStream;
use async_std::task;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::FutureExt;
use log::{debug, warn};
use snow::{Builder, TransportState};

const NOISE_PARAMS: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2b";
const LEN_RECORD_CIPHERTEXT: usize = 20; // 4-byte length + 16-byte tag
const TAG_LEN: usize = 16;

enum Role {
    Initiator { remote_static: [u8; 32] },
    Responder,
}

/// S0/S1/S2 per §4.4. The handshake driver loop matches on this explicitly
/// rather than folding the two round trips into a flat sequence of
/// `.await`s, so the mapping to the teacher's enum-plus-`mem::replace`
/// idiom stays visible even though actual I/O goes through `async`/`await`.
enum HandshakeState {
    S0Start,
    S1AwaitingPeerMessage,
    S2Established,
}

async fn run_handshake(
    stream: &mut TcpStream,
    role: &Role,
    local_static: &[u8; 32],
) -> Result<TransportState, TransportError> {
    let builder = Builder::new(
        NOISE_PARAMS
            .parse()
            .map_err(|_| TransportError::HandshakeFailed("bad noise params string".into()))?,
    );
    let mut handshake = match role {
        Role::Initiator { remote_static } => builder
            .local_private_key(local_static)
            .remote_public_key(remote_static)
            .build_initiator(),
        Role::Responder => builder.local_private_key(local_static).build_responder(),
    }
    .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    let mut state = HandshakeState::S0Start;
    let mut buf = [0u8; 48];
    loop {
        state = match state {
            HandshakeState::S0Start => match role {
                Role::Initiator { .. } => {
                    let mut msg = [0u8; 48];
                    let len = handshake
                        .write_message(&[], &mut msg)
                        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
                    stream
                        .write_all(&msg[..len])
                        .await
                        .map_err(TransportError::Io)?;
                    HandshakeState::S1AwaitingPeerMessage
                }
                Role::Responder => {
                    stream
                        .read_exact(&mut buf)
                        .await
                        .map_err(TransportError::Io)?;
                    handshake
                        .read_message(&buf, &mut [0u8; 48])
                        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
                    let mut msg = [0u8; 48];
                    let len = handshake
                        .write_message(&[], &mut msg)
                        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
                    stream
                        .write_all(&msg[..len])
                        .await
                        .map_err(TransportError::Io)?;
                    HandshakeState::S2Established
                }
            },
            HandshakeState::S1AwaitingPeerMessage => {
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(TransportError::Io)?;
                handshake
                    .read_message(&buf, &mut [0u8; 48])
                    .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
                HandshakeState::S2Established
            }
            HandshakeState::S2Established => {
                debug!("noise handshake established");
                return handshake
                    .into_transport_mode()
                    .map_err(|e| TransportError::HandshakeFailed(e.to_string()));
            }
        };
    }
}

/// Handle to an established, record-framed Noise channel. Owns a
/// background task that drives the handshake, then alternates
/// length-record/payload-record reads and writes for the connection's
/// lifetime.
pub struct NoiseChannel {
    write_tx: Sender<Vec<u8>>,
    read_rx: Receiver<Vec<u8>>,
}

impl NoiseChannel {
    fn spawn(mut stream: TcpStream, role: Role, local_static: [u8; 32]) -> NoiseChannel {
        let (write_tx, write_rx) = unbounded::<Vec<u8>>();
        let (read_tx, read_rx) = unbounded::<Vec<u8>>();

        task::spawn(async move {
            // Writes arriving before the handshake completes queue here and
            // replay, in order, the moment transport mode is entered --
            // the async equivalent of `_pending_writes`.
            let mut pending: Vec<Vec<u8>> = Vec::new();
            let mut transport = loop {
                match run_handshake(&mut stream, &role, &local_static).await {
                    Ok(t) => break t,
                    Err(e) => {
                        warn!("noise handshake failed: {}", e);
                        return;
                    }
                }
            };

            while let Ok(msg) = write_rx.try_recv() {
                pending.push(msg);
            }
            for msg in pending.drain(..) {
                if write_record(&mut stream, &mut transport, &msg).await.is_err() {
                    return;
                }
            }

            loop {
                futures::select! {
                    outgoing = write_rx.recv().fuse() => {
                        match outgoing {
                            Ok(msg) => {
                                if write_record(&mut stream, &mut transport, &msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    incoming = read_record(&mut stream, &mut transport).fuse() => {
                        match incoming {
                            Ok(payload) => {
                                if read_tx.send(payload).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                }
            }
        });

        NoiseChannel { write_tx, read_rx }
    }

    pub fn connect_initiator(stream: TcpStream, local_static: [u8; 32], remote_static: [u8; 32]) -> NoiseChannel {
        NoiseChannel::spawn(stream, Role::Initiator { remote_static }, local_static)
    }

    pub fn accept_responder(stream: TcpStream, local_static: [u8; 32]) -> NoiseChannel {
        NoiseChannel::spawn(stream, Role::Responder, local_static)
    }

    /// Queues a plaintext payload for encryption and transmission. Safe to
    /// call before the handshake completes.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.write_tx
            .send(payload)
            .await
            .map_err(|_| TransportError::ConnectionLost)
    }

    /// Receives the next decrypted payload record.
    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.read_rx.recv().await.map_err(|_| TransportError::ConnectionLost)
    }
}

async fn write_record(
    stream: &mut TcpStream,
    transport: &mut TransportState,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = payload.len() as u32;
    let mut len_cipher = [0u8; LEN_RECORD_CIPHERTEXT];
    transport
        .write_message(&len.to_be_bytes(), &mut len_cipher)
        .map_err(|_| TransportError::DecryptFailed)?;
    stream.write_all(&len_cipher).await.map_err(TransportError::Io)?;

    let mut payload_cipher = vec![0u8; payload.len() + TAG_LEN];
    transport
        .write_message(payload, &mut payload_cipher)
        .map_err(|_| TransportError::DecryptFailed)?;
    stream.write_all(&payload_cipher).await.map_err(TransportError::Io)?;
    Ok(())
}

async fn read_record(stream: &mut TcpStream, transport: &mut TransportState) -> Result<Vec<u8>, TransportError> {
    let mut len_cipher = [0u8; LEN_RECORD_CIPHERTEXT];
    stream.read_exact(&mut len_cipher).await.map_err(TransportError::Io)?;
    let mut len_plain = [0u8; 4];
    transport
        .read_message(&len_cipher, &mut len_plain)
        .map_err(|_| TransportError::DecryptFailed)?;
    let length = u32::from_be_bytes(len_plain) as usize;

    let mut payload_cipher = vec![0u8; length + TAG_LEN];
    stream.read_exact(&mut payload_cipher).await.map_err(TransportError::Io)?;
    let mut payload = vec![0u8; length];
    transport
        .read_message(&payload_cipher, &mut payload)
        .map_err(|_| TransportError::DecryptFailed)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::net::TcpListener;
    use x25519_dalek::{PublicKey, StaticSecret};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = listener.accept();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = futures::join!(accept, connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    /// Fixed (non-random) static keypair for deterministic tests: the NK
    /// pattern only requires the initiator know the responder's *public*
    /// key in advance, so a real peer would learn this out of band the
    /// same way a test fixes it.
    fn fixed_keypair(seed: u8) -> ([u8; 32], [u8; 32]) {
        let private = StaticSecret::from([seed; 32]);
        let public = PublicKey::from(&private);
        (private.to_bytes(), public.to_bytes())
    }

    #[async_std::test]
    async fn handshake_then_round_trip_over_loopback() {
        let (responder_stream, initiator_stream) = loopback_pair().await;
        let (responder_private, responder_public) = fixed_keypair(1);
        let (initiator_private, _) = fixed_keypair(2);

        let responder = NoiseChannel::accept_responder(responder_stream, responder_private);
        let initiator =
            NoiseChannel::connect_initiator(initiator_stream, initiator_private, responder_public);

        // Queued immediately, before the handshake has had any chance to
        // complete -- exercises the pending-write replay path.
        initiator.send(b"hello responder".to_vec()).await.unwrap();
        let received = responder.recv().await.unwrap();
        assert_eq!(received, b"hello responder");

        responder.send(b"hello initiator".to_vec()).await.unwrap();
        let received = initiator.recv().await.unwrap();
        assert_eq!(received, b"hello initiator");
    }

    #[async_std::test]
    async fn record_length_matches_the_framing_invariant() {
        let (mut responder_stream, mut initiator_stream) = loopback_pair().await;
        let (responder_private, responder_public) = fixed_keypair(3);
        let (initiator_private, _) = fixed_keypair(4);

        let (responder_result, initiator_result) = futures::join!(
            run_handshake(&mut responder_stream, &Role::Responder, &responder_private),
            run_handshake(
                &mut initiator_stream,
                &Role::Initiator { remote_static: responder_public },
                &initiator_private
            ),
        );
        let mut initiator_transport = initiator_result.unwrap();
        let _responder_transport = responder_result.unwrap();

        let payload = vec![9u8; 37];
        let write = write_record(&mut initiator_stream, &mut initiator_transport, &payload);
        let read_len_record = async {
            let mut len_cipher = [0u8; LEN_RECORD_CIPHERTEXT];
            responder_stream.read_exact(&mut len_cipher).await.unwrap();
            len_cipher.len()
        };
        let (write_result, len_record_size) = futures::join!(write, read_len_record);
        write_result.unwrap();
        assert_eq!(len_record_size, LEN_RECORD_CIPHERTEXT);

        // `20 + (|p| + 16)`: a 4-byte length field sealed into a 20-byte
        // record, plus the payload sealed with its own 16-byte tag.
        let mut payload_cipher = vec![0u8; payload.len() + TAG_LEN];
        responder_stream.read_exact(&mut payload_cipher).await.unwrap();
        assert_eq!(LEN_RECORD_CIPHERTEXT + payload_cipher.len(), 20 + (payload.len() + 16));
    }
}
