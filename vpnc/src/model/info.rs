//! Tenant, network-instance and connection identifier parsing.
//!
//! Identifiers are structured: tenants match `DEFAULT` or `[CDE]\d{4}`,
//! downlink network instances are `<TENANT>-<NN>` with a two-hex-digit
//! index, and connection names append `-<N>`. The parsed pieces feed
//! the prefix allocator and the XFRM if_id derivation.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Role letter of a non-default tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TenantLetter {
    C,
    D,
    E,
}

impl TenantLetter {
    /// Hex nibble used in prefix offsets and if_ids.
    pub fn nibble(self) -> u8 {
        match self {
            TenantLetter::C => 0xc,
            TenantLetter::D => 0xd,
            TenantLetter::E => 0xe,
        }
    }

    /// Downlink tenants exist in hub mode, endpoint tenants in endpoint mode.
    pub fn is_downlink(self) -> bool {
        matches!(self, TenantLetter::C | TenantLetter::D)
    }

    pub fn as_char(self) -> char {
        match self {
            TenantLetter::C => 'C',
            TenantLetter::D => 'D',
            TenantLetter::E => 'E',
        }
    }
}

/// A validated tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TenantId {
    Default,
    Named { letter: TenantLetter, number: u16 },
}

impl TenantId {
    pub fn is_default(self) -> bool {
        matches!(self, TenantId::Default)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantId::Default => f.write_str("DEFAULT"),
            TenantId::Named { letter, number } => {
                write!(f, "{}{:04}", letter.as_char(), number)
            }
        }
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "DEFAULT" {
            return Ok(TenantId::Default);
        }
        let mut chars = s.chars();
        let letter = match chars.next() {
            Some('C') => TenantLetter::C,
            Some('D') => TenantLetter::D,
            Some('E') => TenantLetter::E,
            _ => return Err(invalid_id(s)),
        };
        let digits: &str = &s[1..];
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_id(s));
        }
        let number: u16 = digits.parse().map_err(|_| invalid_id(s))?;
        Ok(TenantId::Named { letter, number })
    }
}

fn invalid_id(s: &str) -> Error {
    Error::invalid(s, "tenant id must be DEFAULT or match [CDE]NNNN")
}

/// Parsed pieces of a downlink network-instance (or connection) name.
///
/// `tenant_num` keeps the decimal digits interpreted as hexadecimal,
/// mirroring how the identifiers are embedded into IPv6 prefixes:
/// tenant `C0100` occupies the `0x100` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkInfo {
    pub letter: TenantLetter,
    /// Tenant digits read as hex (`C0010` -> 0x10).
    pub tenant_num: u16,
    /// Network-instance index inside the tenant (`C0001-02` -> 2).
    pub ni_index: u8,
    /// Connection id, when the parsed name includes one.
    pub connection: Option<u8>,
}

impl DownlinkInfo {
    /// Parse `C0001-00` or `C0001-00-3`.
    pub fn parse(name: &str) -> Result<Self, Error> {
        let mut parts = name.splitn(3, '-');
        let tenant_part = parts.next().unwrap_or_default();
        let tenant: TenantId = tenant_part.parse()?;
        let (letter, digits) = match tenant {
            TenantId::Named { letter, .. } => (letter, &tenant_part[1..]),
            TenantId::Default => {
                return Err(Error::invalid(name, "DEFAULT has no downlink instances"))
            }
        };
        let tenant_num =
            u16::from_str_radix(digits, 16).map_err(|_| Error::invalid(name, "bad tenant digits"))?;

        let ni_part = parts
            .next()
            .ok_or_else(|| Error::invalid(name, "missing network instance index"))?;
        if ni_part.len() != 2 || !ni_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid(name, "instance index must be two digits"));
        }
        let ni_index = u8::from_str_radix(ni_part, 16)
            .map_err(|_| Error::invalid(name, "bad instance index"))?;

        let connection = match parts.next() {
            None => None,
            Some(c) => Some(
                c.parse::<u8>()
                    .map_err(|_| Error::invalid(name, "bad connection id"))?,
            ),
        };

        Ok(DownlinkInfo {
            letter,
            tenant_num,
            ni_index,
            connection,
        })
    }

    /// Tenant id string, e.g. `C0001`.
    pub fn tenant(&self) -> String {
        format!("{}{:04x}", self.letter.as_char(), self.tenant_num)
            .to_uppercase()
    }
}

/// Check that an NI name belongs to the given tenant and is well formed.
pub fn validate_ni_name(tenant_id: &str, ni_id: &str) -> Result<DownlinkInfo, Error> {
    let info = DownlinkInfo::parse(ni_id)?;
    let expect = format!("{}-{:02x}", tenant_id, info.ni_index);
    if ni_id != expect {
        return Err(Error::invalid(
            ni_id,
            format!("network instance must be named {tenant_id}-NN"),
        ));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_roundtrip() {
        for id in ["DEFAULT", "C0001", "D9999", "E0042"] {
            let parsed: TenantId = id.parse().unwrap();
            assert_eq!(parsed.to_string(), id);
        }
    }

    #[test]
    fn tenant_id_rejects_bad_input() {
        for id in ["", "B0001", "C001", "C00012", "c0001", "CABCD", "DEFAULTX"] {
            assert!(id.parse::<TenantId>().is_err(), "{id} should be invalid");
        }
    }

    #[test]
    fn downlink_info_parses_ni_and_connection() {
        let ni = DownlinkInfo::parse("C0001-00").unwrap();
        assert_eq!(ni.letter, TenantLetter::C);
        assert_eq!(ni.tenant_num, 1);
        assert_eq!(ni.ni_index, 0);
        assert_eq!(ni.connection, None);

        let conn = DownlinkInfo::parse("D0010-10-3").unwrap();
        assert_eq!(conn.letter, TenantLetter::D);
        assert_eq!(conn.tenant_num, 0x10);
        assert_eq!(conn.ni_index, 0x10);
        assert_eq!(conn.connection, Some(3));
    }

    #[test]
    fn ni_name_must_match_tenant() {
        assert!(validate_ni_name("C0001", "C0001-00").is_ok());
        assert!(validate_ni_name("C0001", "C0002-00").is_err());
        assert!(validate_ni_name("C0001", "C0001-0").is_err());
    }
}
