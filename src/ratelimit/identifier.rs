//! Caller identifier derivation from request metadata.

use std::collections::HashMap;
use std::fmt;

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header carrying a single client address set by a trusted proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Identifier used when no address header is present.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Read access to inbound request headers.
///
/// Header names are matched case-insensitively.
pub trait RequestMetadata {
    /// Value of the first header named `name`, if any.
    fn header(&self, name: &str) -> Option<&str>;
}

impl RequestMetadata for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.get(name) {
            return Some(value.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl RequestMetadata for [(&str, &str)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

impl<const N: usize> RequestMetadata for [(&str, &str); N] {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}

/// The key quota is tracked under for one caller.
///
/// The value is opaque; no address validation is performed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The `"unknown"` sentinel.
    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTIFIER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTIFIER
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Derives an [`Identifier`] from request headers.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    forwarded_header: String,
    real_ip_header: String,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new(FORWARDED_FOR_HEADER, REAL_IP_HEADER)
    }
}

impl IdentifierResolver {
    /// Use custom header names for the forwarded chain and the real address.
    pub fn new(forwarded_header: &str, real_ip_header: &str) -> Self {
        Self {
            forwarded_header: forwarded_header.to_string(),
            real_ip_header: real_ip_header.to_string(),
        }
    }

    /// Resolve the caller key.
    ///
    /// Order: first token of the forwarded chain, then the real-address
    /// header, then `"unknown"`. Blank values count as absent.
    pub fn resolve<M>(&self, metadata: &M) -> Identifier
    where
        M: RequestMetadata + ?Sized,
    {
        let forwarded = metadata
            .header(&self.forwarded_header)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        if let Some(first) = forwarded {
            return Identifier::new(first);
        }

        let real = metadata
            .header(&self.real_ip_header)
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        match real {
            Some(ip) => Identifier::new(ip),
            None => Identifier::unknown(),
        }
    }
}
