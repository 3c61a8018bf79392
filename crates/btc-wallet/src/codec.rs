//! Record wire helpers.
//!
//! Persisted wallet, account and master-key records are flat byte layouts
//! using little-endian integers and Bitcoin CompactSize length prefixes.
//! These helpers wrap `std::io` readers/writers with the few primitives the
//! records need.

use crate::{WalletError, WalletResult};
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::{Decodable, Encodable};
use std::io::{Read, Write};

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> WalletResult<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> WalletResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_varint<W: Write>(w: &mut W, v: u64) -> WalletResult<()> {
    VarInt(v)
        .consensus_encode(bitcoin::io::from_std_mut(w))
        .map_err(|e| WalletError::Io(std::io::Error::from(e)))
        .map(|_| ())
}

pub fn write_varbytes<W: Write>(w: &mut W, data: &[u8]) -> WalletResult<()> {
    write_varint(w, data.len() as u64)?;
    w.write_all(data)?;
    Ok(())
}

pub fn write_varstring<W: Write>(w: &mut W, s: &str) -> WalletResult<()> {
    write_varbytes(w, s.as_bytes())
}

pub fn read_u8<R: Read>(r: &mut R) -> WalletResult<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32<R: Read>(r: &mut R) -> WalletResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_bytes<R: Read, const N: usize>(r: &mut R) -> WalletResult<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_varint<R: Read>(r: &mut R) -> WalletResult<u64> {
    let v = VarInt::consensus_decode(bitcoin::io::from_std_mut(r))
        .map_err(|e| WalletError::Record(format!("bad varint: {}", e)))?;
    Ok(v.0)
}

/// Read a length-prefixed byte string, refusing lengths over `max`.
pub fn read_varbytes<R: Read>(r: &mut R, max: usize) -> WalletResult<Vec<u8>> {
    let len = read_varint(r)? as usize;
    if len > max {
        return Err(WalletError::Record(format!(
            "length {} exceeds maximum {}",
            len, max
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_varstring<R: Read>(r: &mut R, max: usize) -> WalletResult<String> {
    let bytes = read_varbytes(r, max)?;
    String::from_utf8(bytes).map_err(|_| WalletError::Record("invalid utf-8".into()))
}
