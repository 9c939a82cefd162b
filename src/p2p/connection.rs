// btoken_node/src/p2p/connection.rs
// Message framing on a byte stream and the version handshake.

use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chainparams::ChainParams;
use crate::codec::{Decodable, Encodable};
use crate::p2p::messages::{MessageHeader, NetMessage, VersionMessage, MIN_PEER_PROTO_VERSION, NODE_NETWORK};
use crate::util::calculate_checksum;

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames `message` for the network identified by `magic`.
pub fn frame_message(magic: [u8; 4], message: &NetMessage) -> Vec<u8> {
    let payload = message.encode_payload();
    let header = MessageHeader {
        magic,
        command: message.command(),
        length: payload.len() as u32,
        checksum: calculate_checksum(&payload),
    };
    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(&payload);
    bytes
}

pub async fn send_message<W>(stream: &mut W, magic: [u8; 4], message: &NetMessage) -> Result<(), IoError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&frame_message(magic, message)).await?;
    stream.flush().await
}

/// Reads one framed message, checking magic, size and checksum.
pub async fn read_message<R>(stream: &mut R, params: &ChainParams) -> Result<NetMessage, IoError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; MessageHeader::SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = MessageHeader::consensus_decode(&mut Cursor::new(&header_buf))?;

    if header.magic != params.magic {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("Invalid magic bytes: {:?}. Expected: {:?}", header.magic, params.magic),
        ));
    }
    if header.length > MAX_PAYLOAD_SIZE {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("Payload length {} exceeds limit of {}", header.length, MAX_PAYLOAD_SIZE),
        ));
    }

    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        stream.read_exact(&mut payload).await?;
    }
    let checksum = calculate_checksum(&payload);
    if checksum != header.checksum {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("{} checksum mismatch. Expected {:?}, got {:?}", header.command_str(), header.checksum, checksum),
        ));
    }
    debug!("Received {} ({} bytes)", header.command_str(), payload.len());
    NetMessage::decode(&header.command, &payload, params)
}

/// Exchanges version and verack. Returns the peer's version message.
/// Rejects connections to ourselves (same nonce), outdated peers and peers
/// that do not serve blocks.
pub async fn perform_handshake<S>(
    stream: &mut S,
    params: &ChainParams,
    peer_addr: SocketAddr,
    our_nonce: u64,
    our_height: u32,
) -> Result<VersionMessage, IoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = VersionMessage::new(params, peer_addr, our_nonce, our_height);
    send_message(stream, params.magic, &NetMessage::Version(ours)).await?;
    debug!("Sent Version message to {}", peer_addr);

    let mut peer_version: Option<VersionMessage> = None;
    let mut verack_received = false;
    while peer_version.is_none() || !verack_received {
        match read_message(stream, params).await? {
            NetMessage::Version(version) => {
                if peer_version.is_some() {
                    return Err(IoError::new(IoErrorKind::InvalidData, "Duplicate version message"));
                }
                if version.nonce == our_nonce {
                    return Err(IoError::new(IoErrorKind::Other, "Connected to self (same nonce)"));
                }
                if version.version < MIN_PEER_PROTO_VERSION {
                    return Err(IoError::new(
                        IoErrorKind::Other,
                        format!("Peer protocol version {} too old", version.version),
                    ));
                }
                if version.services & NODE_NETWORK == 0 {
                    return Err(IoError::new(IoErrorKind::Other, "Peer does not offer NODE_NETWORK"));
                }
                send_message(stream, params.magic, &NetMessage::Verack).await?;
                peer_version = Some(version);
            }
            NetMessage::Verack => verack_received = true,
            NetMessage::Ping(nonce) => send_message(stream, params.magic, &NetMessage::Pong(nonce)).await?,
            other => debug!(
                "Ignoring {} from {} during handshake",
                crate::p2p::messages::command_str(&other.command()),
                peer_addr
            ),
        }
    }

    let version = peer_version.ok_or_else(|| IoError::new(IoErrorKind::Other, "Handshake ended without version"))?;
    info!(
        "Handshake with {} complete: version {}, agent \"{}\", height {}",
        peer_addr, version.version, version.user_agent, version.start_height
    );
    Ok(version)
}
