//! The D-Bus message: header fields plus a typed body.
//!
//! This is the "message codec" collaborator the connection engine treats as external:
//! the engine only ever constructs messages through the constructors below and reads
//! them back through the header-field accessors, never touching wire bytes directly.

pub mod codec;

use enumflags2::{bitflags, BitFlags};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlags {
    NoReplyExpected = 0x1,
    NoAutoStart = 0x2,
    AllowInteractiveAuth = 0x4,
}

#[derive(Debug, Clone)]
pub struct PrimaryHeader {
    pub endian: u8,
    pub msg_type: MessageType,
    pub flags: BitFlags<MessageFlags>,
    pub protocol_version: u8,
    pub body_length: u32,
    pub serial: u32,
}

impl PrimaryHeader {
    fn new(msg_type: MessageType, flags: BitFlags<MessageFlags>) -> Self {
        PrimaryHeader {
            endian: codec::NATIVE_ENDIAN_SIG,
            msg_type,
            flags,
            protocol_version: 1,
            body_length: 0,
            serial: 0,
        }
    }
}

/// The header fields array, D-Bus field codes 1 through 9.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub primary: PrimaryHeader,
    pub fields: Fields,
    pub body: Vec<Value>,
}

impl Message {
    pub fn method_call(
        path: &str,
        interface: Option<&str>,
        destination: Option<&str>,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        let signature = crate::value::body_signature(&body);
        Message {
            primary: PrimaryHeader::new(MessageType::MethodCall, BitFlags::empty()),
            fields: Fields {
                path: Some(path.to_owned()),
                interface: interface.map(str::to_owned),
                member: Some(member.to_owned()),
                destination: destination.map(str::to_owned),
                signature: non_empty(signature),
                ..Default::default()
            },
            body,
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str, body: Vec<Value>) -> Self {
        let signature = crate::value::body_signature(&body);
        Message {
            primary: PrimaryHeader::new(MessageType::Signal, BitFlags::empty()),
            fields: Fields {
                path: Some(path.to_owned()),
                interface: Some(interface.to_owned()),
                member: Some(member.to_owned()),
                signature: non_empty(signature),
                ..Default::default()
            },
            body,
        }
    }

    /// Build the `MethodReturn` reply to `call`.
    pub fn method_return(call: &Message, body: Vec<Value>) -> Self {
        let signature = crate::value::body_signature(&body);
        Message {
            primary: PrimaryHeader::new(MessageType::MethodReturn, BitFlags::empty()),
            fields: Fields {
                reply_serial: Some(call.primary.serial),
                destination: call.fields.sender.clone(),
                signature: non_empty(signature),
                ..Default::default()
            },
            body,
        }
    }

    /// Build the `Error` reply to `call`.
    pub fn method_error(call: &Message, error_name: &str, body: Vec<Value>) -> Self {
        let signature = crate::value::body_signature(&body);
        Message {
            primary: PrimaryHeader::new(MessageType::Error, BitFlags::empty()),
            fields: Fields {
                reply_serial: Some(call.primary.serial),
                destination: call.fields.sender.clone(),
                error_name: Some(error_name.to_owned()),
                signature: non_empty(signature),
                ..Default::default()
            },
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.primary.msg_type
    }

    pub fn serial(&self) -> u32 {
        self.primary.serial
    }

    pub fn path(&self) -> Option<&str> {
        self.fields.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.fields.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.fields.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.fields.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.fields.reply_serial
    }

    pub fn sender(&self) -> Option<&str> {
        self.fields.sender.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.fields.destination.as_deref()
    }

    pub fn no_reply_expected(&self) -> bool {
        self.primary.flags.contains(MessageFlags::NoReplyExpected)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_carries_signature_from_body() {
        let msg = Message::method_call(
            "/org/example",
            Some("org.example.Iface"),
            Some("org.example.Dest"),
            "Do",
            vec![Value::U32(7)],
        );
        assert_eq!(msg.fields.signature.as_deref(), Some("u"));
        assert_eq!(msg.member(), Some("Do"));
    }

    #[test]
    fn empty_body_has_no_signature_field() {
        let msg = Message::method_call("/o", None, None, "Do", vec![]);
        assert_eq!(msg.fields.signature, None);
    }

    #[test]
    fn method_return_targets_caller_as_reply() {
        let mut call = Message::method_call("/o", None, None, "Do", vec![]);
        call.primary.serial = 42;
        call.fields.sender = Some(":1.5".into());
        let reply = Message::method_return(&call, vec![]);
        assert_eq!(reply.reply_serial(), Some(42));
        assert_eq!(reply.destination(), Some(":1.5"));
    }
}
