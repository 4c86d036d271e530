use std::collections::BTreeMap;

use thiserror::Error;

/// Magic prefix of every component snapshot blob.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"FESN";

/// Version of the container format itself (header + TLV framing).
pub const FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const HEADER_LEN: usize = 4 + 4 + 4 + 4;
const FIELD_HEADER_LEN: usize = 2 + 4;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot format version {major}.{minor}")]
    UnsupportedFormatVersion { major: u16, minor: u16 },

    #[error("snapshot device id mismatch (expected {expected:?}, found {found:?})")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported device major version (expected {expected}, found {found})")]
    UnsupportedDeviceMajorVersion { expected: u16, found: u16 },

    #[error("duplicate snapshot field tag {0}")]
    DuplicateFieldTag(u16),

    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),

    #[error("trailing bytes after field: {0} bytes")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Builds a snapshot blob. Fields are emitted in ascending tag order regardless of insertion
/// order, so two identical component states always encode to identical bytes.
#[derive(Debug)]
pub struct SnapshotWriter {
    device_id: [u8; 4],
    device_version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            device_id,
            device_version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.fields.insert(tag, bytes);
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field_bytes(tag, vec![value]);
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field_u8(tag, u8::from(value));
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let body_len: usize = self
            .fields
            .values()
            .map(|v| FIELD_HEADER_LEN + v.len())
            .sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.major.to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.minor.to_le_bytes());
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.device_version.minor.to_le_bytes());

        for (tag, value) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            let len = u32::try_from(value.len()).expect("snapshot field larger than 4GiB");
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&value);
        }
        out
    }
}

/// Parsed view over a snapshot blob.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::UnexpectedEof);
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let u16_at = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);

        let format_version = SnapshotVersion::new(u16_at(4), u16_at(6));
        if format_version.major != FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion {
                major: format_version.major,
                minor: format_version.minor,
            });
        }

        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(&bytes[8..12]);
        if device_id != expected_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_id,
                found: device_id,
            });
        }
        let device_version = SnapshotVersion::new(u16_at(12), u16_at(14));

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < FIELD_HEADER_LEN {
                return Err(SnapshotError::UnexpectedEof);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[FIELD_HEADER_LEN..];
            if rest.len() < len {
                return Err(SnapshotError::UnexpectedEof);
            }
            let (value, tail) = rest.split_at(len);
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
            rest = tail;
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn ensure_device_major(&self, major: u16) -> SnapshotResult<()> {
        if self.header.device_version.major != major {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion {
                expected: major,
                found: self.header.device_version.major,
            });
        }
        Ok(())
    }

    /// Tags present in the blob, in ascending order.
    pub fn tags(&self) -> impl Iterator<Item = u16> + '_ {
        self.fields.keys().copied()
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(&self, tag: u16, what: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(buf) => {
                let arr: [u8; N] = buf
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding(what))?;
                Ok(Some(arr))
            }
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8")?.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag, "u16")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag, "u32")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag, "u64")?.map(u64::from_le_bytes))
    }
}
