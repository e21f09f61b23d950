use static_assertions::assert_impl_all;
use std::fmt;
use std::str::FromStr;

const BASE_UUID_BYTES: [u8; 16] = [0, 0, 0, 0, 0, 0, 0x10, 0, 0x80, 0, 0, 0x80, 0x5F, 0x9B, 0x34, 0xFB];

/// Bluetooth-tailored UUID.
///
/// Parsing accepts the full 36-character form as well as bare 16-bit (`180d`) and 32-bit
/// (`0000180d`) short forms, which are expanded against the Base UUID. Hex digits are
/// case-insensitive, so two UUIDs reported by the bus in different cases compare equal.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Returns UUID with all bytes set to zero.
    pub const fn zeroed() -> Self {
        Self([0; 16])
    }

    /// Returns the Base UUID (`00000000-0000-1000-8000-00805F9B34FB`) as defined by the specs.
    pub const fn base() -> Self {
        Self(BASE_UUID_BYTES)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Expands an assigned 16-bit number, e.g. `0x180d` for Heart Rate.
    pub const fn from_u16(v: u16) -> Self {
        let mut r = BASE_UUID_BYTES;
        r[2] = (v >> 8) as u8;
        r[3] = v as u8;
        Self(r)
    }

    pub const fn from_u32(v: u32) -> Self {
        let mut r = BASE_UUID_BYTES;
        r[0] = (v >> 24) as u8;
        r[1] = (v >> 16) as u8;
        r[2] = (v >> 8) as u8;
        r[3] = v as u8;
        Self(r)
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Returns the 16-bit assigned number if this UUID is derived from the Base UUID.
    pub fn as_u16(&self) -> Option<u16> {
        if self.shorten().len() == 2 {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }

    /// Returns the shortest possible UUID that is equivalent of this UUID.
    pub fn shorten(&self) -> &[u8] {
        if self.0[4..] == BASE_UUID_BYTES[4..] {
            if self.0[0..2] == BASE_UUID_BYTES[0..2] {
                &self.0[2..4]
            } else {
                &self.0[..4]
            }
        } else {
            &self.0
        }
    }
}

assert_impl_all!(Uuid: Send, Sync);

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3],
            self.0[4], self.0[5], self.0[6], self.0[7],
            self.0[8], self.0[9], self.0[10], self.0[11],
            self.0[12], self.0[13], self.0[14], self.0[15])
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(v: [u8; 16]) -> Self {
        Self::from_bytes(v)
    }
}

impl From<u16> for Uuid {
    fn from(v: u16) -> Self {
        Self::from_u16(v)
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().as_bytes();
        match s.len() {
            4 => {
                let mut buf = [0; 2];
                decode(s, &mut buf)?;
                Ok(Self::from_u16(u16::from_be_bytes(buf)))
            }
            8 => {
                let mut buf = [0; 4];
                decode(s, &mut buf)?;
                Ok(Self::from_u32(u32::from_be_bytes(buf)))
            }
            36 => {
                // (dash position, byte offset)
                const GROUPS: [(usize, usize); 4] = [(8, 4), (13, 6), (18, 8), (23, 10)];
                if GROUPS.iter().any(|&(dash, _)| s[dash] != b'-') {
                    return Err(UuidParseError(()));
                }
                let mut buf = [0; 16];
                let mut src_start = 0;
                let mut dst_start = 0;
                for &(dash, dst_end) in &GROUPS {
                    decode(&s[src_start..dash], &mut buf[dst_start..dst_end])?;
                    src_start = dash + 1;
                    dst_start = dst_end;
                }
                decode(&s[src_start..], &mut buf[dst_start..])?;
                Ok(buf.into())
            }
            _ => Err(UuidParseError(())),
        }
    }
}

fn decode(src: &[u8], dst: &mut [u8]) -> Result<(), UuidParseError> {
    if src.len() != dst.len() * 2 {
        return Err(UuidParseError(()));
    }

    fn dig(c: u8) -> Result<u8, UuidParseError> {
        Ok(match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return Err(UuidParseError(())),
        })
    }

    for (s, d) in src.chunks(2).zip(dst.iter_mut()) {
        *d = (dig(s[0])? << 4) | dig(s[1])?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct UuidParseError(());

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid UUID string")
    }
}

impl std::error::Error for UuidParseError {}
