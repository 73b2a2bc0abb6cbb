//! Translation between protocol URIs and canonical oneM2M addresses.
//!
//! Protocol paths encode the address scope with a marker segment:
//!
//! ```text
//! protocol        canonical        scope
//! /~/cse/cb/x     /cse/cb/x        SP-relative
//! /_/sp/cse/cb    //sp/cse/cb      absolute
//! /cb/x           cb/x             CSE-relative
//! ```

use crate::error::ProtocolError;

/// Scope of a canonical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `cb/ae/cnt`, relative to the receiving CSE.
    CseRelative { path: Vec<String> },
    /// `/cse-id/cb/ae`, relative to the service provider.
    SpRelative { cse_id: String, path: Vec<String> },
    /// `//sp-id/cse-id/cb/ae`.
    Absolute {
        sp_id: String,
        cse_id: String,
        path: Vec<String>,
    },
}

impl Address {
    /// Parses a canonical address.
    pub fn parse(canonical: &str) -> Result<Self, ProtocolError> {
        let canonical = canonical.trim();
        if let Some(rest) = canonical.strip_prefix("//") {
            let mut segments = split_segments(rest);
            if segments.len() < 2 {
                return Err(invalid(canonical));
            }
            let path = segments.split_off(2);
            let cse_id = segments.pop().ok_or_else(|| invalid(canonical))?;
            let sp_id = segments.pop().ok_or_else(|| invalid(canonical))?;
            Ok(Address::Absolute { sp_id, cse_id, path })
        } else if let Some(rest) = canonical.strip_prefix('/') {
            let mut segments = split_segments(rest);
            if segments.is_empty() {
                return Err(invalid(canonical));
            }
            let cse_id = segments.remove(0);
            Ok(Address::SpRelative {
                cse_id,
                path: segments,
            })
        } else {
            let path = split_segments(canonical);
            if path.is_empty() {
                return Err(invalid(canonical));
            }
            Ok(Address::CseRelative { path })
        }
    }

    /// CSE the address points into, if it names one.
    pub fn cse_id(&self) -> Option<&str> {
        match self {
            Address::CseRelative { .. } => None,
            Address::SpRelative { cse_id, .. } | Address::Absolute { cse_id, .. } => Some(cse_id),
        }
    }

    /// Path segments below the CSE.
    pub fn path(&self) -> &[String] {
        match self {
            Address::CseRelative { path }
            | Address::SpRelative { path, .. }
            | Address::Absolute { path, .. } => path,
        }
    }
}

fn split_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid(value: &str) -> ProtocolError {
    ProtocolError::InvalidValue {
        field: "to",
        value: value.to_string(),
    }
}

/// Converts a protocol URI path into a canonical address.
pub fn to_canonical(protocol_uri: &str) -> String {
    let trimmed = protocol_uri.trim();
    let without_root = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if let Some(rest) = without_root.strip_prefix("~/") {
        format!("/{}", rest)
    } else if let Some(rest) = without_root.strip_prefix("_/") {
        format!("//{}", rest)
    } else {
        without_root.to_string()
    }
}

/// Converts a canonical address into a protocol URI path.
pub fn to_protocol(canonical: &str) -> String {
    let canonical = canonical.trim();
    if let Some(rest) = canonical.strip_prefix("//") {
        format!("/_/{}", rest)
    } else if let Some(rest) = canonical.strip_prefix('/') {
        format!("/~/{}", rest)
    } else {
        format!("/{}", canonical)
    }
}
