//! `org.freedesktop.DBus*` names shared between inbound dispatch and outbound bus calls.
//!
//! These are pure string constants and a couple of free functions, not methods on the
//! core connection types: the spec treats Introspectable/Peer/Properties handling as
//! delegated capability interfaces the core calls out to, not as responsibilities the
//! connection itself owns.

pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const BUS_DESTINATION: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub mod error_name {
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
}

pub mod member {
    pub const HELLO: &str = "Hello";
    pub const REQUEST_NAME: &str = "RequestName";
    pub const RELEASE_NAME: &str = "ReleaseName";
    pub const LIST_NAMES: &str = "ListNames";
    pub const LIST_ACTIVATABLE_NAMES: &str = "ListActivatableNames";
    pub const NAME_HAS_OWNER: &str = "NameHasOwner";
    pub const GET_NAME_OWNER: &str = "GetNameOwner";
    pub const LIST_QUEUED_OWNERS: &str = "ListQueuedOwners";
    pub const ADD_MATCH: &str = "AddMatch";
    pub const REMOVE_MATCH: &str = "RemoveMatch";
    pub const GET_ID: &str = "GetId";
    pub const GET_MACHINE_ID: &str = "GetMachineId";
    pub const PING: &str = "Ping";

    pub const NAME_ACQUIRED: &str = "NameAcquired";
    pub const NAME_LOST: &str = "NameLost";
    pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
}

/// Bitflags accepted/returned by `RequestName`, mirroring the reference bus daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ReleaseNameReply::Released),
            2 => Some(ReleaseNameReply::NonExistent),
            3 => Some(ReleaseNameReply::NotOwner),
            _ => None,
        }
    }
}

/// Answer the `org.freedesktop.DBus.Peer` interface locally, without bothering the bus.
pub mod peer {
    use crate::value::Value;

    pub fn handle(member: &str, _args: &[Value]) -> Result<Vec<Value>, (String, Vec<Value>)> {
        match member {
            "Ping" => Ok(vec![]),
            "GetMachineId" => Ok(vec![Value::Str(machine_id_placeholder())]),
            _ => Err((super::error_name::UNKNOWN_METHOD.into(), vec![])),
        }
    }

    fn machine_id_placeholder() -> String {
        std::fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| "0".repeat(32))
    }
}

/// Answer `org.freedesktop.DBus.Introspectable` with a minimal, always-valid document.
pub mod introspectable {
    use crate::object_tree::ObjectTree;
    use crate::value::Value;

    pub fn handle(
        tree: &ObjectTree,
        path: &str,
        member: &str,
        _args: &[Value],
    ) -> Result<Vec<Value>, (String, Vec<Value>)> {
        if member != "Introspect" {
            return Err((super::error_name::UNKNOWN_METHOD.into(), vec![]));
        }
        let interface_name = tree
            .lookup(path)
            .map(|i| i.interface_name())
            .unwrap_or_default();
        let xml = format!(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n\
             <node name=\"{path}\">\n  <interface name=\"{iface}\"/>\n</node>\n",
            path = path,
            iface = interface_name,
        );
        Ok(vec![Value::Str(xml)])
    }
}

/// Answer `org.freedesktop.DBus.Properties` for hosted objects that don't implement it
/// themselves. Since this core has no typed property tables, every call fails with
/// `UnknownProperty` -- hosted objects that want properties implement the interface
/// directly instead of relying on this fallback.
pub mod properties {
    use crate::value::Value;

    pub fn handle(_member: &str, _args: &[Value]) -> Result<Vec<Value>, (String, Vec<Value>)> {
        Err((super::error_name::UNKNOWN_PROPERTY.into(), vec![]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_name_reply_round_trips() {
        assert_eq!(RequestNameReply::from_u32(1), Some(RequestNameReply::PrimaryOwner));
        assert_eq!(RequestNameReply::from_u32(99), None);
    }

    #[test]
    fn peer_ping_returns_empty_body() {
        assert_eq!(peer::handle("Ping", &[]).unwrap(), vec![]);
    }

    #[test]
    fn peer_unknown_member_is_unknown_method() {
        let err = peer::handle("Bogus", &[]).unwrap_err();
        assert_eq!(err.0, error_name::UNKNOWN_METHOD);
    }

    #[test]
    fn properties_fallback_always_unknown_property() {
        let err = properties::handle("Get", &[]).unwrap_err();
        assert_eq!(err.0, error_name::UNKNOWN_PROPERTY);
    }
}
