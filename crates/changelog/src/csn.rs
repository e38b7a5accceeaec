use crate::error::DecodeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Length of the text form of a CSN
pub const CSN_STRING_LEN: usize = 28;

/// Length of the binary (storage key) form of a CSN
pub const CSN_BYTES_LEN: usize = 14;

/// Change Sequence Number
///
/// Globally comparable identity of a single change.
///
/// Text layout (28 lower-case hex chars): [time: 16][server_id: 4][seqnum: 8]
/// Binary layout (14 bytes, big-endian):  [time: u64][server_id: u16][seqnum: u32]
///
/// Both layouts are fixed width, so byte/string comparison of an encoding
/// is the same as comparing `(time, server_id, seqnum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Csn {
    time: u64,
    server_id: u16,
    seqnum: u32,
}

impl Csn {
    pub const fn new(time: u64, server_id: u16, seqnum: u32) -> Self {
        Self {
            time,
            server_id,
            seqnum,
        }
    }

    /// Wall clock milliseconds at which this CSN was issued
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Serialize to the fixed 14-byte sortable key
    pub fn to_bytes(&self) -> [u8; CSN_BYTES_LEN] {
        let mut bytes = [0u8; CSN_BYTES_LEN];
        bytes[..8].copy_from_slice(&self.time.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.server_id.to_be_bytes());
        bytes[10..].copy_from_slice(&self.seqnum.to_be_bytes());
        bytes
    }

    /// Deserialize from the fixed 14-byte format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CSN_BYTES_LEN {
            return Err(DecodeError::InvalidCsnLength(bytes.len()));
        }

        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[..8]);
        let mut server_id = [0u8; 2];
        server_id.copy_from_slice(&bytes[8..10]);
        let mut seqnum = [0u8; 4];
        seqnum.copy_from_slice(&bytes[10..]);

        Ok(Self {
            time: u64::from_be_bytes(time),
            server_id: u16::from_be_bytes(server_id),
            seqnum: u32::from_be_bytes(seqnum),
        })
    }

    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    pub fn is_older_than_or_equal_to(&self, other: &Csn) -> bool {
        self <= other
    }

    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    pub fn is_newer_than_or_equal_to(&self, other: &Csn) -> bool {
        self >= other
    }
}

/// Compare two optional CSNs, `None` being older than any CSN
pub fn compare(a: Option<&Csn>, b: Option<&Csn>) -> Ordering {
    // Option's derived order already puts None first
    a.cmp(&b)
}

pub fn is_older_than(a: Option<&Csn>, b: Option<&Csn>) -> bool {
    compare(a, b) == Ordering::Less
}

pub fn is_older_than_or_equal_to(a: Option<&Csn>, b: Option<&Csn>) -> bool {
    compare(a, b) != Ordering::Greater
}

pub fn is_newer_than(a: Option<&Csn>, b: Option<&Csn>) -> bool {
    compare(a, b) == Ordering::Greater
}

pub fn is_newer_than_or_equal_to(a: Option<&Csn>, b: Option<&Csn>) -> bool {
    compare(a, b) != Ordering::Less
}

/// Number of changes `a` is ahead of `b`, best effort
///
/// Returns 0 when `a` is missing or not strictly newer than `b`, and
/// `a.seqnum` when `b` is missing. When `a` is newer but its seqnum is lower
/// (the counter restarted on a later millisecond), the difference wraps
/// modulo 2^32.
pub fn diff_seq_num(a: Option<&Csn>, b: Option<&Csn>) -> u32 {
    let Some(a) = a else {
        return 0;
    };
    let Some(b) = b else {
        return a.seqnum;
    };
    if !a.is_newer_than(b) {
        return 0;
    }
    a.seqnum.wrapping_sub(b.seqnum)
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.time, self.server_id, self.seqnum
        )
    }
}

impl FromStr for Csn {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_STRING_LEN {
            return Err(DecodeError::InvalidCsnLength(s.len()));
        }
        // from_str_radix tolerates a leading '+', the wire format does not
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeError::InvalidCsnHex(s.to_string()));
        }

        let invalid = |_| DecodeError::InvalidCsnHex(s.to_string());
        let time = u64::from_str_radix(&s[..16], 16).map_err(invalid)?;
        let server_id = u16::from_str_radix(&s[16..20], 16).map_err(invalid)?;
        let seqnum = u32::from_str_radix(&s[20..], 16).map_err(invalid)?;

        Ok(Self::new(time, server_id, seqnum))
    }
}

impl Serialize for Csn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Csn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Anything positioned in a log by a CSN
pub trait CsnKeyed {
    fn csn(&self) -> &Csn;
}

impl CsnKeyed for Csn {
    fn csn(&self) -> &Csn {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_csn_to_string_literals() {
        assert_eq!(
            Csn::new(1, 1, 0).to_string(),
            "0000000000000001000100000000"
        );
        assert_eq!(
            Csn::new(0x12ABC, 45, 123).to_string(),
            "0000000000012abc002d0000007b"
        );
    }

    #[test]
    fn test_csn_from_str() {
        let csn: Csn = "0000000000012abc002d0000007b".parse().unwrap();
        assert_eq!(csn.time(), 0x12ABC);
        assert_eq!(csn.server_id(), 45);
        assert_eq!(csn.seqnum(), 123);

        let upper: Csn = "0000000000012ABC002D0000007B".parse().unwrap();
        assert_eq!(upper, csn);
    }

    #[test]
    fn test_csn_from_str_invalid() {
        assert_eq!(
            "".parse::<Csn>(),
            Err(DecodeError::InvalidCsnLength(0))
        );
        assert!("0000000000012abc002d0000007".parse::<Csn>().is_err());
        assert!("0000000000012abc002d0000007bb".parse::<Csn>().is_err());
        assert!("0000000000012abc002d000000zz".parse::<Csn>().is_err());
        assert!("+000000000012abc002d0000007b".parse::<Csn>().is_err());
    }

    #[test]
    fn test_csn_roundtrip_string() {
        let csn1 = Csn::new(u64::MAX, u16::MAX, u32::MAX);
        let csn2: Csn = csn1.to_string().parse().unwrap();
        assert_eq!(csn1, csn2);

        let zero = Csn::new(0, 0, 0);
        assert_eq!(zero.to_string(), "0".repeat(CSN_STRING_LEN));
        assert_eq!(zero.to_string().parse::<Csn>().unwrap(), zero);
    }

    #[test]
    fn test_csn_roundtrip_bytes() {
        let csn1 = Csn::new(0x0102030405060708, 0x090a, 0x0b0c0d0e);
        let bytes = csn1.to_bytes();
        assert_eq!(
            bytes,
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]
        );
        assert_eq!(Csn::from_bytes(&bytes).unwrap(), csn1);
        assert_eq!(
            Csn::from_bytes(&bytes[..13]),
            Err(DecodeError::InvalidCsnLength(13))
        );
    }

    #[test]
    fn test_csn_ordering() {
        let a = Csn::new(1, 9, 9);
        let b = Csn::new(2, 0, 0);
        let c = Csn::new(2, 1, 0);
        let d = Csn::new(2, 1, 1);

        assert!(a < b);
        assert!(b < c); // server id breaks time ties
        assert!(c < d); // then seqnum

        for (x, y) in [(a, b), (b, c), (c, d), (d, a)] {
            assert_eq!(x.cmp(&y), x.to_string().cmp(&y.to_string()));
            assert_eq!(x.cmp(&y), x.to_bytes().cmp(&y.to_bytes()));
        }
    }

    #[test]
    fn test_csn_equality_and_hash() {
        let a = Csn::new(10, 2, 3);
        let b: Csn = a.to_string().parse().unwrap();
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_compare_helpers_with_none() {
        let csn = Csn::new(0, 0, 0);

        assert_eq!(compare(None, None), Ordering::Equal);
        assert!(is_newer_than(Some(&csn), None));
        assert!(is_older_than(None, Some(&csn)));
        assert!(is_older_than_or_equal_to(None, None));
        assert!(is_newer_than_or_equal_to(None, None));
        assert!(!is_newer_than(None, None));
        assert!(is_newer_than_or_equal_to(Some(&csn), Some(&csn)));
        assert!(!is_older_than(Some(&csn), Some(&csn)));
    }

    #[test]
    fn test_csn_methods() {
        let old = Csn::new(1, 1, 1);
        let new = Csn::new(1, 1, 2);

        assert!(old.is_older_than(&new));
        assert!(old.is_older_than_or_equal_to(&old));
        assert!(new.is_newer_than(&old));
        assert!(new.is_newer_than_or_equal_to(&new));
        assert!(!new.is_older_than(&old));
    }

    #[test]
    fn test_diff_seq_num() {
        let csn0 = Csn::new(0, 0, 0);
        let csn3 = Csn::new(0, 0, 3);
        let csn4 = Csn::new(0, 0, 4);

        assert_eq!(diff_seq_num(Some(&csn3), Some(&csn0)), 3);
        assert_eq!(diff_seq_num(Some(&csn3), Some(&csn4)), 0);
        assert_eq!(diff_seq_num(Some(&csn3), Some(&csn3)), 0);
        assert_eq!(diff_seq_num(Some(&csn3), None), 3);
        assert_eq!(diff_seq_num(None, Some(&csn3)), 0);
        assert_eq!(diff_seq_num(None, None), 0);
    }

    #[test]
    fn test_diff_seq_num_wraps_when_counter_restarted() {
        // newer millisecond, counter restarted below the older seqnum
        let older = Csn::new(10, 1, 5);
        let newer = Csn::new(11, 1, 2);
        assert_eq!(diff_seq_num(Some(&newer), Some(&older)), u32::MAX - 2);
    }

    #[test]
    fn test_csn_serde_as_string() {
        let csn = Csn::new(0x12ABC, 45, 123);
        let json = serde_json::to_string(&csn).unwrap();
        assert_eq!(json, "\"0000000000012abc002d0000007b\"");
        let back: Csn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, csn);
        assert!(serde_json::from_str::<Csn>("\"nope\"").is_err());
    }
}
