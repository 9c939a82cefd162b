// btoken_node/src/codec.rs
// Consensus serialization primitives shared by blocks, images and wire messages.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Write};

use crate::util::Hash;

pub const MAX_VAR_BYTES: u64 = 4 * 1024 * 1024;

pub trait Encodable {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.consensus_encode(&mut buffer);
        buffer
    }
}

pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError>;
}

pub fn write_var_int<W: Write + WriteBytesExt>(w: &mut W, n: u64) -> Result<usize, IoError> {
    if n < 0xfd {
        w.write_u8(n as u8)?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_u8(0xfd)?;
        w.write_u16::<LittleEndian>(n as u16)?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_u8(0xfe)?;
        w.write_u32::<LittleEndian>(n as u32)?;
        Ok(5)
    } else {
        w.write_u8(0xff)?;
        w.write_u64::<LittleEndian>(n)?;
        Ok(9)
    }
}

pub fn read_var_int<R: Read + ReadBytesExt>(r: &mut R) -> Result<u64, IoError> {
    match r.read_u8()? {
        0xff => r.read_u64::<LittleEndian>(),
        0xfe => r.read_u32::<LittleEndian>().map(|x| x as u64),
        0xfd => r.read_u16::<LittleEndian>().map(|x| x as u64),
        n => Ok(n as u64),
    }
}

pub fn var_int_size(n: u64) -> usize {
    if n < 0xfd {
        1
    } else if n <= 0xffff {
        3
    } else if n <= 0xffff_ffff {
        5
    } else {
        9
    }
}

pub fn write_var_bytes<W: Write + WriteBytesExt>(w: &mut W, bytes: &[u8]) -> Result<usize, IoError> {
    let written = write_var_int(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(written + bytes.len())
}

pub fn read_var_bytes<R: Read + ReadBytesExt>(r: &mut R) -> Result<Vec<u8>, IoError> {
    let length = read_var_int(r)?;
    if length > MAX_VAR_BYTES {
        return Err(IoError::new(IoErrorKind::InvalidData, "VarBytes too long"));
    }
    let mut buffer = vec![0u8; length as usize];
    if length > 0 {
        r.read_exact(&mut buffer)?;
    }
    Ok(buffer)
}

pub fn write_var_string<W: Write + WriteBytesExt>(w: &mut W, s: &str) -> Result<usize, IoError> {
    write_var_bytes(w, s.as_bytes())
}

pub fn read_var_string<R: Read + ReadBytesExt>(r: &mut R) -> Result<String, IoError> {
    let bytes = read_var_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| IoError::new(IoErrorKind::InvalidData, "Invalid UTF-8 in VarString"))
}

pub fn read_hash<R: Read + ReadBytesExt>(r: &mut R) -> Result<Hash, IoError> {
    let mut hash = [0u8; 32];
    r.read_exact(&mut hash)?;
    Ok(hash)
}
