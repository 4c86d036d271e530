//! Little-endian field payload helpers used inside a single TLV field.

use super::{SnapshotError, SnapshotResult};

#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(u8::from(v))
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed (`u32`) byte string.
    pub fn vec_u8(self, v: &[u8]) -> Self {
        let len = u32::try_from(v.len()).expect("encoded byte string larger than 4GiB");
        self.u32(len).bytes(v)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
        if self.buf.len() < len {
            return Err(SnapshotError::UnexpectedEof);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> SnapshotResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> SnapshotResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&mut self) -> SnapshotResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn vec_u8(&mut self) -> SnapshotResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    pub fn finish(self) -> SnapshotResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(SnapshotError::TrailingBytes(self.buf.len()))
        }
    }
}
