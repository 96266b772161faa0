//! Kernel references (`ko12`, `kp40`), vat references (`o+3`, `o-7`, `o+d5/1`, `p+2`), and vat ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefParseError {
    #[error("malformed kernel reference '{0}'")]
    KernelRef(String),
    #[error("malformed vat reference '{0}'")]
    VatRef(String),
    #[error("malformed vat id '{0}'")]
    VatId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Object,
    Promise,
}

/// Kernel-wide identifier for an object (`ko<N>`) or a promise (`kp<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelRef {
    Object(u64),
    Promise(u64),
}

impl KernelRef {
    pub fn kind(&self) -> RefKind {
        match self {
            KernelRef::Object(_) => RefKind::Object,
            KernelRef::Promise(_) => RefKind::Promise,
        }
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KernelRef::Promise(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, KernelRef::Object(_))
    }
}

impl fmt::Display for KernelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelRef::Object(id) => write!(f, "ko{id}"),
            KernelRef::Promise(id) => write!(f, "kp{id}"),
        }
    }
}

impl FromStr for KernelRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RefParseError::KernelRef(s.to_string());
        let (ctor, digits): (fn(u64) -> KernelRef, &str) = if let Some(rest) = s.strip_prefix("ko") {
            (KernelRef::Object, rest)
        } else if let Some(rest) = s.strip_prefix("kp") {
            (KernelRef::Promise, rest)
        } else {
            return Err(err());
        };
        parse_id(digits).map(ctor).ok_or_else(err)
    }
}

/// Vat identifier, rendered `v<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VatId(pub u32);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(parse_id)
            .and_then(|id| u32::try_from(id).ok())
            .map(VatId)
            .ok_or_else(|| RefParseError::VatId(s.to_string()))
    }
}

/// Whether an exported object survives the vat's restart boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Ephemeral,
    Virtual,
    Durable,
}

/// A vat-local reference.
///
/// `exported` means the vat allocated the id (`+`); imports (`-`) are allocated by the
/// kernel. Only exported objects may be virtual (`o+vN`) or durable (`o+dN`), optionally
/// with a facet suffix (`/M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VatRef {
    kind: RefKind,
    exported: bool,
    id: u64,
    durability: Durability,
    facet: Option<u64>,
}

impl VatRef {
    pub fn object_export(id: u64) -> Self {
        Self::plain(RefKind::Object, true, id)
    }

    pub fn object_import(id: u64) -> Self {
        Self::plain(RefKind::Object, false, id)
    }

    pub fn promise_export(id: u64) -> Self {
        Self::plain(RefKind::Promise, true, id)
    }

    pub fn promise_import(id: u64) -> Self {
        Self::plain(RefKind::Promise, false, id)
    }

    /// `o+vN` or `o+vN/facet`.
    pub fn virtual_export(id: u64, facet: Option<u64>) -> Self {
        Self {
            durability: Durability::Virtual,
            facet,
            ..Self::object_export(id)
        }
    }

    /// `o+dN` or `o+dN/facet`.
    pub fn durable_export(id: u64, facet: Option<u64>) -> Self {
        Self {
            durability: Durability::Durable,
            facet,
            ..Self::object_export(id)
        }
    }

    fn plain(kind: RefKind, exported: bool, id: u64) -> Self {
        Self {
            kind,
            exported,
            id,
            durability: Durability::Ephemeral,
            facet: None,
        }
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    pub fn is_promise(&self) -> bool {
        self.kind == RefKind::Promise
    }

    pub fn is_object(&self) -> bool {
        self.kind == RefKind::Object
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }
}

impl fmt::Display for VatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        };
        let sign = if self.exported { '+' } else { '-' };
        let tag = match self.durability {
            Durability::Ephemeral => "",
            Durability::Virtual => "v",
            Durability::Durable => "d",
        };
        write!(f, "{kind}{sign}{tag}{}", self.id)?;
        if let Some(facet) = self.facet {
            write!(f, "/{facet}")?;
        }
        Ok(())
    }
}

impl FromStr for VatRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RefParseError::VatRef(s.to_string());
        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('o') => RefKind::Object,
            Some('p') => RefKind::Promise,
            _ => return Err(err()),
        };
        let exported = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(err()),
        };
        let rest = chars.as_str();
        let (durability, rest) = if let Some(rest) = rest.strip_prefix('v') {
            (Durability::Virtual, rest)
        } else if let Some(rest) = rest.strip_prefix('d') {
            (Durability::Durable, rest)
        } else {
            (Durability::Ephemeral, rest)
        };
        let (id, facet) = match rest.split_once('/') {
            Some((id, facet)) => (id, Some(parse_id(facet).ok_or_else(err)?)),
            None => (rest, None),
        };
        let id = parse_id(id).ok_or_else(err)?;
        let tagged = durability != Durability::Ephemeral;
        if (tagged || facet.is_some()) && !(kind == RefKind::Object && exported && tagged) {
            return Err(err());
        }
        Ok(Self {
            kind,
            exported,
            id,
            durability,
            facet,
        })
    }
}

/// Decimal id without sign or leading zeros (other than `0` itself).
fn parse_id(digits: &str) -> Option<u64> {
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'));
    if canonical { digits.parse().ok() } else { None }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(KernelRef);
string_serde!(VatRef);
string_serde!(VatId);
