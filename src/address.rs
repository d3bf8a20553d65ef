//! Bus address parsing.
//!
//! Only the `unix:path=...`/`unix:abstract=...` transport is supported, which covers
//! every bus daemon this crate is likely to ever talk to. Session/system defaults are
//! resolved the same way the reference D-Bus implementations do: from well-known
//! environment variables, falling back to the per-user runtime directory.

use std::env;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    UnixPath(String),
    UnixAbstract(String),
}

impl Address {
    /// Parse a single D-Bus address string (the part before any `;` alternative list).
    pub fn parse(addr: &str) -> Result<Self> {
        let first = addr.split(';').next().unwrap_or(addr);
        let (transport, rest) = first
            .split_once(':')
            .ok_or_else(|| Error::Configuration(format!("missing transport in {:?}", addr)))?;
        if transport != "unix" {
            return Err(Error::Configuration(format!(
                "unsupported transport {:?}",
                transport
            )));
        }
        for kv in rest.split(',') {
            if let Some(path) = kv.strip_prefix("path=") {
                return Ok(Address::UnixPath(unescape(path)));
            }
            if let Some(path) = kv.strip_prefix("abstract=") {
                return Ok(Address::UnixAbstract(unescape(path)));
            }
        }
        Err(Error::Configuration(format!(
            "unix transport missing path/abstract key in {:?}",
            addr
        )))
    }

    /// The session bus address: `$DBUS_SESSION_BUS_ADDRESS`, or a well-known fallback
    /// path under the per-user runtime directory.
    ///
    /// Reads `$XDG_RUNTIME_DIR` rather than the `$XDG_USER_DIR` named by the spec this
    /// crate was built against -- see the "session bus fallback variable" decision in
    /// DESIGN.md.
    pub fn session() -> Result<Self> {
        if let Ok(addr) = env::var("DBUS_SESSION_BUS_ADDRESS") {
            return Self::parse(&addr);
        }
        let runtime_dir = env::var("XDG_RUNTIME_DIR")
            .map_err(|_| Error::Configuration("DBUS_SESSION_BUS_ADDRESS not set and XDG_RUNTIME_DIR not set".into()))?;
        Ok(Address::UnixPath(format!("{}/bus", runtime_dir)))
    }

    /// The system bus address: `$DBUS_SYSTEM_BUS_ADDRESS`, or the standard well-known
    /// socket path.
    pub fn system() -> Result<Self> {
        if let Ok(addr) = env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            return Self::parse(&addr);
        }
        Ok(Address::UnixPath("/run/dbus/system_bus_socket".into()))
    }
}

/// Reverse the percent-encoding the D-Bus address grammar uses for reserved bytes.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let addr = Address::parse("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(addr, Address::UnixPath("/run/dbus/system_bus_socket".into()));
    }

    #[test]
    fn parses_unix_abstract() {
        let addr = Address::parse("unix:abstract=/tmp/dbus-xyz").unwrap();
        assert_eq!(addr, Address::UnixAbstract("/tmp/dbus-xyz".into()));
    }

    #[test]
    fn parses_only_first_alternative() {
        let addr = Address::parse("unix:path=/a;unix:path=/b").unwrap();
        assert_eq!(addr, Address::UnixPath("/a".into()));
    }

    #[test]
    fn unescapes_percent_encoded_path() {
        let addr = Address::parse("unix:path=/tmp/foo%2cbar").unwrap();
        assert_eq!(addr, Address::UnixPath("/tmp/foo,bar".into()));
    }

    #[test]
    fn rejects_unsupported_transport() {
        assert!(Address::parse("tcp:host=localhost,port=1234").is_err());
    }

    #[test]
    fn rejects_missing_transport() {
        assert!(Address::parse("garbage").is_err());
    }
}
