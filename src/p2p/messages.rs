// btoken_node/src/p2p/messages.rs
// Wire messages exchanged with peers of either chain.

use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::blockchain::block::Block;
use crate::blockchain::header::{Header, HEADER_SIZE};
use crate::blockchain::transaction::Transaction;
use crate::chainparams::ChainParams;
use crate::codec::{read_hash, read_var_int, read_var_string, write_var_int, write_var_string, Decodable, Encodable};
use crate::util::Hash;

pub const MIN_PEER_PROTO_VERSION: i32 = 70001;
pub const NODE_NETWORK: u64 = 1;
pub const CMD_VERSION: &[u8; 12] = b"version\0\0\0\0\0";
pub const CMD_VERACK: &[u8; 12] = b"verack\0\0\0\0\0\0";
pub const CMD_PING: &[u8; 12] = b"ping\0\0\0\0\0\0\0\0";
pub const CMD_PONG: &[u8; 12] = b"pong\0\0\0\0\0\0\0\0";
pub const CMD_GETHEADERS: &[u8; 12] = b"getheaders\0\0";
pub const CMD_HEADERS: &[u8; 12] = b"headers\0\0\0\0\0";
pub const CMD_GETDATA: &[u8; 12] = b"getdata\0\0\0\0\0";
pub const CMD_INV: &[u8; 12] = b"inv\0\0\0\0\0\0\0\0\0";
pub const CMD_BLOCK: &[u8; 12] = b"block\0\0\0\0\0\0\0";
pub const CMD_TX: &[u8; 12] = b"tx\0\0\0\0\0\0\0\0\0\0";
pub const CMD_NOTFOUND: &[u8; 12] = b"notfound\0\0\0\0";
pub const CMD_REJECT: &[u8; 12] = b"reject\0\0\0\0\0\0";
pub const MAX_HEADERS_PER_MSG: usize = 2000;
pub const MAX_INV_PER_MSG: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InventoryType {
    Error = 0,
    Tx = 1,
    Block = 2,
}

impl InventoryType {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::Error),
            1 => Some(Self::Tx),
            2 => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub const SIZE: usize = 24;

    pub fn command_str(&self) -> String {
        command_str(&self.command)
    }
}

pub fn command_str(command: &[u8; 12]) -> String {
    String::from_utf8_lossy(command).trim_end_matches('\0').to_string()
}

impl Encodable for MessageHeader {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_all(&self.magic)?;
        w.write_all(&self.command)?;
        w.write_u32::<LittleEndian>(self.length)?;
        w.write_all(&self.checksum)?;
        Ok(Self::SIZE)
    }
}

impl Decodable for MessageHeader {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let mut command = [0u8; 12];
        r.read_exact(&mut command)?;
        let length = r.read_u32::<LittleEndian>()?;
        let mut checksum = [0u8; 4];
        r.read_exact(&mut checksum)?;
        Ok(MessageHeader { magic, command, length, checksum })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetAddr {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddr {
    pub fn new(address: SocketAddr, services: u64) -> Self {
        let ip = match address.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetAddr { services, ip, port: address.port() }
    }

    pub fn unspecified() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0)
    }
}

impl Encodable for NetAddr {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_u64::<LittleEndian>(self.services)?;
        w.write_all(&self.ip)?;
        // Port travels in network byte order.
        w.write_u16::<byteorder::BigEndian>(self.port)?;
        Ok(26)
    }
}

impl Decodable for NetAddr {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let services = r.read_u64::<LittleEndian>()?;
        let mut ip = [0u8; 16];
        r.read_exact(&mut ip)?;
        let port = r.read_u16::<byteorder::BigEndian>()?;
        Ok(NetAddr { services, ip, port })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(params: &ChainParams, peer: SocketAddr, nonce: u64, start_height: u32) -> Self {
        VersionMessage {
            version: params.protocol_version,
            services: NODE_NETWORK,
            timestamp: chrono::Utc::now().timestamp(),
            addr_recv: NetAddr::new(peer, NODE_NETWORK),
            addr_from: NetAddr::unspecified(),
            nonce,
            user_agent: format!("/btoken-node:{}/", env!("CARGO_PKG_VERSION")),
            start_height: start_height as i32,
            relay: true,
        }
    }
}

impl Encodable for VersionMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 0;
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.services)?;
        w.write_i64::<LittleEndian>(self.timestamp)?;
        written += 20;
        written += self.addr_recv.consensus_encode(w)?;
        written += self.addr_from.consensus_encode(w)?;
        w.write_u64::<LittleEndian>(self.nonce)?;
        written += 8;
        written += write_var_string(w, &self.user_agent)?;
        w.write_i32::<LittleEndian>(self.start_height)?;
        w.write_u8(self.relay as u8)?;
        Ok(written + 5)
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let version = r.read_i32::<LittleEndian>()?;
        let services = r.read_u64::<LittleEndian>()?;
        let timestamp = r.read_i64::<LittleEndian>()?;
        let addr_recv = NetAddr::consensus_decode(r)?;
        let addr_from = NetAddr::consensus_decode(r)?;
        let nonce = r.read_u64::<LittleEndian>()?;
        let user_agent = read_var_string(r)?;
        let start_height = r.read_i32::<LittleEndian>()?;
        // Older peers omit the relay flag.
        let relay = r.read_u8().map(|b| b != 0).unwrap_or(true);
        Ok(VersionMessage { version, services, timestamp, addr_recv, addr_from, nonce, user_agent, start_height, relay })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: i32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

impl Encodable for GetHeadersMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_i32::<LittleEndian>(self.version)?;
        let mut written = 4 + write_var_int(w, self.locator.len() as u64)?;
        for hash in &self.locator {
            w.write_all(hash)?;
            written += 32;
        }
        w.write_all(&self.hash_stop)?;
        Ok(written + 32)
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let version = r.read_i32::<LittleEndian>()?;
        let count = read_var_int(r)?;
        if count > 500 {
            return Err(IoError::new(IoErrorKind::InvalidData, format!("locator with {} hashes", count)));
        }
        let locator = (0..count).map(|_| read_hash(r)).collect::<Result<Vec<_>, _>>()?;
        let hash_stop = read_hash(r)?;
        Ok(GetHeadersMessage { version, locator, hash_stop })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryVector {
    pub inv_type: InventoryType,
    pub hash: Hash,
}

impl InventoryVector {
    pub fn block(hash: Hash) -> Self {
        InventoryVector { inv_type: InventoryType::Block, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        InventoryVector { inv_type: InventoryType::Tx, hash }
    }
}

impl Encodable for InventoryVector {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_u32::<LittleEndian>(self.inv_type as u32)?;
        w.write_all(&self.hash)?;
        Ok(36)
    }
}

impl Decodable for InventoryVector {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let raw = r.read_u32::<LittleEndian>()?;
        // Witness and filtered variants set high bits; they map onto the base type.
        let inv_type = InventoryType::from_u32(raw & 0x3fff_ffff).unwrap_or(InventoryType::Error);
        Ok(InventoryVector { inv_type, hash: read_hash(r)? })
    }
}

fn encode_inventory<W: Write + WriteBytesExt>(w: &mut W, items: &[InventoryVector]) -> Result<usize, IoError> {
    let mut written = write_var_int(w, items.len() as u64)?;
    for item in items {
        written += item.consensus_encode(w)?;
    }
    Ok(written)
}

fn decode_inventory<R: Read + ReadBytesExt>(r: &mut R) -> Result<Vec<InventoryVector>, IoError> {
    let count = read_var_int(r)?;
    if count as usize > MAX_INV_PER_MSG {
        return Err(IoError::new(IoErrorKind::InvalidData, format!("inventory with {} items", count)));
    }
    (0..count).map(|_| InventoryVector::consensus_decode(r)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
}

impl Encodable for RejectMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = write_var_string(w, &self.message)?;
        w.write_u8(self.code)?;
        written += 1 + write_var_string(w, &self.reason)?;
        Ok(written)
    }
}

impl Decodable for RejectMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        Ok(RejectMessage { message: read_var_string(r)?, code: r.read_u8()?, reason: read_var_string(r)? })
    }
}

/// Every message the node consumes or produces.
#[derive(Debug, Clone)]
pub enum NetMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<Header>),
    GetData(Vec<InventoryVector>),
    Inv(Vec<InventoryVector>),
    Block(Block),
    Tx(Transaction),
    NotFound(Vec<InventoryVector>),
    Reject(RejectMessage),
    /// Commands this node does not handle; skipped without error.
    Unknown([u8; 12]),
}

fn invalid(error: impl std::fmt::Display) -> IoError {
    IoError::new(IoErrorKind::InvalidData, error.to_string())
}

impl NetMessage {
    pub fn command(&self) -> [u8; 12] {
        match self {
            NetMessage::Version(_) => *CMD_VERSION,
            NetMessage::Verack => *CMD_VERACK,
            NetMessage::Ping(_) => *CMD_PING,
            NetMessage::Pong(_) => *CMD_PONG,
            NetMessage::GetHeaders(_) => *CMD_GETHEADERS,
            NetMessage::Headers(_) => *CMD_HEADERS,
            NetMessage::GetData(_) => *CMD_GETDATA,
            NetMessage::Inv(_) => *CMD_INV,
            NetMessage::Block(_) => *CMD_BLOCK,
            NetMessage::Tx(_) => *CMD_TX,
            NetMessage::NotFound(_) => *CMD_NOTFOUND,
            NetMessage::Reject(_) => *CMD_REJECT,
            NetMessage::Unknown(command) => *command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_payload(&mut payload);
        payload
    }

    fn write_payload(&self, w: &mut Vec<u8>) -> Result<(), IoError> {
        match self {
            NetMessage::Version(version) => {
                version.consensus_encode(w)?;
            }
            NetMessage::Verack | NetMessage::Unknown(_) => {}
            NetMessage::Ping(nonce) | NetMessage::Pong(nonce) => w.write_u64::<LittleEndian>(*nonce)?,
            NetMessage::GetHeaders(message) => {
                message.consensus_encode(w)?;
            }
            NetMessage::Headers(headers) => {
                write_var_int(w, headers.len() as u64)?;
                for header in headers {
                    w.write_all(&header.serialize())?;
                    // Transaction count, always zero in a headers message.
                    write_var_int(w, 0)?;
                }
            }
            NetMessage::GetData(items) | NetMessage::Inv(items) | NetMessage::NotFound(items) => {
                encode_inventory(w, items)?;
            }
            NetMessage::Block(block) => w.write_all(&block.buffer)?,
            NetMessage::Tx(tx) => {
                tx.consensus_encode(w)?;
            }
            NetMessage::Reject(reject) => {
                reject.consensus_encode(w)?;
            }
        }
        Ok(())
    }

    /// Decodes the payload of `command`. Headers and blocks are bound to the
    /// chain's parameters.
    pub fn decode(command: &[u8; 12], payload: &[u8], params: &ChainParams) -> Result<NetMessage, IoError> {
        let mut r = Cursor::new(payload);
        let message = match command {
            c if c == CMD_VERSION => NetMessage::Version(VersionMessage::consensus_decode(&mut r)?),
            c if c == CMD_VERACK => NetMessage::Verack,
            c if c == CMD_PING => NetMessage::Ping(r.read_u64::<LittleEndian>().unwrap_or(0)),
            c if c == CMD_PONG => NetMessage::Pong(r.read_u64::<LittleEndian>()?),
            c if c == CMD_GETHEADERS => NetMessage::GetHeaders(GetHeadersMessage::consensus_decode(&mut r)?),
            c if c == CMD_HEADERS => {
                let count = read_var_int(&mut r)? as usize;
                if count > MAX_HEADERS_PER_MSG {
                    return Err(invalid(format!("headers message with {} headers", count)));
                }
                let mut headers = Vec::with_capacity(count);
                let mut raw = [0u8; HEADER_SIZE];
                for _ in 0..count {
                    r.read_exact(&mut raw)?;
                    headers.push(Header::parse(&raw, 0, params).map_err(invalid)?);
                    read_var_int(&mut r)?;
                }
                NetMessage::Headers(headers)
            }
            c if c == CMD_GETDATA => NetMessage::GetData(decode_inventory(&mut r)?),
            c if c == CMD_INV => NetMessage::Inv(decode_inventory(&mut r)?),
            c if c == CMD_NOTFOUND => NetMessage::NotFound(decode_inventory(&mut r)?),
            c if c == CMD_BLOCK => {
                let block = Block::parse(payload, 0, params).map_err(invalid)?;
                if block.buffer.len() != payload.len() {
                    return Err(invalid(format!(
                        "block message carries {} trailing bytes",
                        payload.len() - block.buffer.len()
                    )));
                }
                return Ok(NetMessage::Block(block));
            }
            c if c == CMD_TX => NetMessage::Tx(Transaction::consensus_decode(&mut r)?),
            c if c == CMD_REJECT => NetMessage::Reject(RejectMessage::consensus_decode(&mut r)?),
            other => return Ok(NetMessage::Unknown(*other)),
        };
        Ok(message)
    }
}
