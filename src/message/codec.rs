//! Hand-rolled D-Bus wire marshaling.
//!
//! Byte order, alignment and length-prefixing follow the D-Bus specification's marshaling
//! rules directly over `byteorder`, in the style of manual marshaling code that doesn't
//! route everything through a generic serde pipeline: every container writes its own
//! padding explicitly rather than deriving it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{Fields, Message, MessageFlags, MessageType, PrimaryHeader};
use crate::value::{Error as ValueError, Result as ValueResult, Value};

#[cfg(target_endian = "little")]
pub const NATIVE_ENDIAN_SIG: u8 = b'l';
#[cfg(target_endian = "big")]
pub const NATIVE_ENDIAN_SIG: u8 = b'B';

const HEADER_FIELD_PATH: u8 = 1;
const HEADER_FIELD_INTERFACE: u8 = 2;
const HEADER_FIELD_MEMBER: u8 = 3;
const HEADER_FIELD_ERROR_NAME: u8 = 4;
const HEADER_FIELD_REPLY_SERIAL: u8 = 5;
const HEADER_FIELD_DESTINATION: u8 = 6;
const HEADER_FIELD_SENDER: u8 = 7;
const HEADER_FIELD_SIGNATURE: u8 = 8;
const HEADER_FIELD_UNIX_FDS: u8 = 9;

fn align(pos: usize, to: usize) -> usize {
    (pos + to - 1) / to * to
}

struct Writer {
    buf: Vec<u8>,
    big_endian: bool,
}

impl Writer {
    fn new(big_endian: bool) -> Self {
        Writer {
            buf: Vec::new(),
            big_endian,
        }
    }

    fn pad_to(&mut self, boundary: usize) {
        let target = align(self.buf.len(), boundary);
        self.buf.resize(target, 0);
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.pad_to(2);
        let mut tmp = [0u8; 2];
        if self.big_endian {
            BigEndian::write_u16(&mut tmp, v);
        } else {
            LittleEndian::write_u16(&mut tmp, v);
        }
        self.buf.extend_from_slice(&tmp);
    }

    fn write_u32(&mut self, v: u32) {
        self.pad_to(4);
        let mut tmp = [0u8; 4];
        if self.big_endian {
            BigEndian::write_u32(&mut tmp, v);
        } else {
            LittleEndian::write_u32(&mut tmp, v);
        }
        self.buf.extend_from_slice(&tmp);
    }

    fn write_u64(&mut self, v: u64) {
        self.pad_to(8);
        let mut tmp = [0u8; 8];
        if self.big_endian {
            BigEndian::write_u64(&mut tmp, v);
        } else {
            LittleEndian::write_u64(&mut tmp, v);
        }
        self.buf.extend_from_slice(&tmp);
    }

    fn write_f64(&mut self, v: f64) {
        self.pad_to(8);
        let mut tmp = [0u8; 8];
        if self.big_endian {
            BigEndian::write_f64(&mut tmp, v);
        } else {
            LittleEndian::write_f64(&mut tmp, v);
        }
        self.buf.extend_from_slice(&tmp);
    }

    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn write_signature_str(&mut self, s: &str) {
        self.write_u8(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn write_value(&mut self, value: &Value) -> ValueResult<()> {
        match value {
            Value::Byte(b) => self.write_u8(*b),
            Value::Bool(b) => self.write_u32(*b as u32),
            Value::I16(v) => self.write_u16(*v as u16),
            Value::U16(v) => self.write_u16(*v),
            Value::I32(v) => self.write_u32(*v as u32),
            Value::U32(v) => self.write_u32(*v),
            Value::I64(v) => self.write_u64(*v as u64),
            Value::U64(v) => self.write_u64(*v),
            Value::F64(v) => self.write_f64(*v),
            Value::Str(s) | Value::ObjectPath(s) => self.write_string(s),
            Value::Signature(s) => self.write_signature_str(s),
            Value::Array(elem_sig, items) => {
                self.write_u32(0); // length patched below
                let len_pos = self.buf.len() - 4;
                self.pad_to(array_element_alignment(elem_sig));
                let start = self.buf.len();
                for item in items {
                    self.write_value(item)?;
                }
                let len = (self.buf.len() - start) as u32;
                let mut tmp = [0u8; 4];
                if self.big_endian {
                    BigEndian::write_u32(&mut tmp, len);
                } else {
                    LittleEndian::write_u32(&mut tmp, len);
                }
                self.buf[len_pos..len_pos + 4].copy_from_slice(&tmp);
            }
            Value::Struct(fields) => {
                self.pad_to(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::Variant(inner) => {
                self.write_signature_str(&inner.signature());
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}

fn array_element_alignment(sig: &str) -> usize {
    match sig.as_bytes().first() {
        Some(b'y') => 1,
        Some(b'n') | Some(b'q') => 2,
        Some(b'b') | Some(b'i') | Some(b'u') | Some(b'a') | Some(b's') | Some(b'o') => 4,
        Some(b'g') => 1,
        Some(b'x') | Some(b't') | Some(b'd') | Some(b'(') => 8,
        Some(b'v') => 1,
        _ => 1,
    }
}

/// Encode a complete message: primary header, fields array, padding, then body.
///
/// `msg.primary.serial` must already be set by the caller (the connection engine owns
/// serial allocation).
pub fn encode(msg: &Message) -> ValueResult<Vec<u8>> {
    let big_endian = msg.primary.endian == b'B';

    let mut body = Writer::new(big_endian);
    for value in &msg.body {
        body.write_value(value)?;
    }

    let mut w = Writer::new(big_endian);
    w.write_u8(msg.primary.endian);
    w.write_u8(msg.primary.msg_type as u8);
    w.write_u8(msg.primary.flags.bits());
    w.write_u8(msg.primary.protocol_version);
    w.write_u32(body.buf.len() as u32);
    w.write_u32(msg.primary.serial);

    write_fields(&mut w, &msg.fields);
    w.pad_to(8);

    w.buf.extend_from_slice(&body.buf);
    Ok(w.buf)
}

fn write_fields(w: &mut Writer, fields: &Fields) {
    let len_pos = {
        w.write_u32(0);
        w.buf.len() - 4
    };
    w.pad_to(8);
    let start = w.buf.len();

    if let Some(path) = &fields.path {
        write_field_header(w, HEADER_FIELD_PATH, "o");
        w.write_string(path);
    }
    if let Some(iface) = &fields.interface {
        write_field_header(w, HEADER_FIELD_INTERFACE, "s");
        w.write_string(iface);
    }
    if let Some(member) = &fields.member {
        write_field_header(w, HEADER_FIELD_MEMBER, "s");
        w.write_string(member);
    }
    if let Some(err) = &fields.error_name {
        write_field_header(w, HEADER_FIELD_ERROR_NAME, "s");
        w.write_string(err);
    }
    if let Some(serial) = fields.reply_serial {
        write_field_header(w, HEADER_FIELD_REPLY_SERIAL, "u");
        w.write_u32(serial);
    }
    if let Some(dest) = &fields.destination {
        write_field_header(w, HEADER_FIELD_DESTINATION, "s");
        w.write_string(dest);
    }
    if let Some(sender) = &fields.sender {
        write_field_header(w, HEADER_FIELD_SENDER, "s");
        w.write_string(sender);
    }
    if let Some(sig) = &fields.signature {
        write_field_header(w, HEADER_FIELD_SIGNATURE, "g");
        w.write_signature_str(sig);
    }
    if let Some(fds) = fields.unix_fds {
        write_field_header(w, HEADER_FIELD_UNIX_FDS, "u");
        w.write_u32(fds);
    }

    let len = (w.buf.len() - start) as u32;
    let mut tmp = [0u8; 4];
    if w.big_endian {
        BigEndian::write_u32(&mut tmp, len);
    } else {
        LittleEndian::write_u32(&mut tmp, len);
    }
    w.buf[len_pos..len_pos + 4].copy_from_slice(&tmp);
}

fn write_field_header(w: &mut Writer, code: u8, sig: &str) {
    w.pad_to(8);
    w.write_u8(code);
    w.write_signature_str(sig);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Reader {
            buf,
            pos: 0,
            big_endian,
        }
    }

    fn require(&self, n: usize) -> ValueResult<()> {
        if self.pos + n > self.buf.len() {
            Err(ValueError::InsufficientData)
        } else {
            Ok(())
        }
    }

    fn skip_padding(&mut self, boundary: usize) -> ValueResult<()> {
        let target = align(self.pos, boundary);
        self.require(target - self.pos)?;
        if self.buf[self.pos..target].iter().any(|&b| b != 0) {
            return Err(ValueError::PaddingNotZero);
        }
        self.pos = target;
        Ok(())
    }

    fn read_u8(&mut self) -> ValueResult<u8> {
        self.require(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> ValueResult<u16> {
        self.skip_padding(2)?;
        self.require(2)?;
        let v = if self.big_endian {
            BigEndian::read_u16(&self.buf[self.pos..])
        } else {
            LittleEndian::read_u16(&self.buf[self.pos..])
        };
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> ValueResult<u32> {
        self.skip_padding(4)?;
        self.require(4)?;
        let v = if self.big_endian {
            BigEndian::read_u32(&self.buf[self.pos..])
        } else {
            LittleEndian::read_u32(&self.buf[self.pos..])
        };
        self.pos += 4;
        Ok(v)
    }

    fn read_u64(&mut self) -> ValueResult<u64> {
        self.skip_padding(8)?;
        self.require(8)?;
        let v = if self.big_endian {
            BigEndian::read_u64(&self.buf[self.pos..])
        } else {
            LittleEndian::read_u64(&self.buf[self.pos..])
        };
        self.pos += 8;
        Ok(v)
    }

    fn read_f64(&mut self) -> ValueResult<f64> {
        self.skip_padding(8)?;
        self.require(8)?;
        let v = if self.big_endian {
            BigEndian::read_f64(&self.buf[self.pos..])
        } else {
            LittleEndian::read_f64(&self.buf[self.pos..])
        };
        self.pos += 8;
        Ok(v)
    }

    fn read_string(&mut self) -> ValueResult<String> {
        let len = self.read_u32()? as usize;
        self.require(len + 1)?;
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len])?.to_owned();
        self.pos += len + 1; // skip nul terminator
        Ok(s)
    }

    fn read_signature_str(&mut self) -> ValueResult<String> {
        let len = self.read_u8()? as usize;
        self.require(len + 1)?;
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len])?.to_owned();
        self.pos += len + 1;
        Ok(s)
    }

    fn read_value(&mut self, sig: &str) -> ValueResult<Value> {
        match sig {
            "y" => Ok(Value::Byte(self.read_u8()?)),
            "b" => Ok(Value::Bool(self.read_u32()? != 0)),
            "n" => Ok(Value::I16(self.read_u16()? as i16)),
            "q" => Ok(Value::U16(self.read_u16()?)),
            "i" => Ok(Value::I32(self.read_u32()? as i32)),
            "u" => Ok(Value::U32(self.read_u32()?)),
            "x" => Ok(Value::I64(self.read_u64()? as i64)),
            "t" => Ok(Value::U64(self.read_u64()?)),
            "d" => Ok(Value::F64(self.read_f64()?)),
            "s" => Ok(Value::Str(self.read_string()?)),
            "o" => Ok(Value::ObjectPath(self.read_string()?)),
            "g" => Ok(Value::Signature(self.read_signature_str()?)),
            "v" => {
                let inner_sig = self.read_signature_str()?;
                let inner = self.read_value(&inner_sig)?;
                Ok(Value::Variant(Box::new(inner)))
            }
            _ if sig.starts_with('a') => {
                let elem_sig = &sig[1..];
                let len = self.read_u32()? as usize;
                self.skip_padding(array_element_alignment(elem_sig))?;
                let end = self.pos + len;
                let mut items = Vec::new();
                while self.pos < end {
                    items.push(self.read_value(elem_sig)?);
                }
                Ok(Value::Array(elem_sig.to_owned(), items))
            }
            _ if sig.starts_with('(') && sig.ends_with(')') => {
                self.skip_padding(8)?;
                let inner = &sig[1..sig.len() - 1];
                let mut fields = Vec::new();
                for field_sig in split_struct_signature(inner) {
                    fields.push(self.read_value(&field_sig)?);
                }
                Ok(Value::Struct(fields))
            }
            _ => Err(ValueError::InvalidSignature(sig.to_owned())),
        }
    }
}

/// Split a struct's inner signature into one signature string per field, respecting
/// nested parens/arrays (`"us(iy)"` -> `["u", "s", "(iy)"]`).
fn split_struct_signature(sig: &str) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = sig.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            b'(' => {
                let mut depth = 1;
                i += 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
            b'a' => {
                i += 1;
                if i < bytes.len() && bytes[i] == b'(' {
                    let mut depth = 1;
                    i += 1;
                    while i < bytes.len() && depth > 0 {
                        match bytes[i] {
                            b'(' => depth += 1,
                            b')' => depth -= 1,
                            _ => {}
                        }
                        i += 1;
                    }
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
        out.push(sig[start..i].to_owned());
    }
    out
}

/// Try to decode one complete message from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` doesn't yet contain a full message (the caller should read
/// more bytes and retry); never consumes partial input.
pub fn try_decode(buf: &[u8]) -> ValueResult<Option<(Message, usize)>> {
    if buf.len() < 16 {
        return Ok(None);
    }
    let endian = buf[0];
    let big_endian = endian == b'B';
    let msg_type = MessageType::from_u8(buf[1]).ok_or(ValueError::IncorrectType)?;
    let flags_bits = buf[2];
    let flags = enumflags2::BitFlags::<MessageFlags>::from_bits(flags_bits)
        .map_err(|_| ValueError::IncorrectType)?;
    let protocol_version = buf[3];
    let body_length = if big_endian {
        BigEndian::read_u32(&buf[4..8])
    } else {
        LittleEndian::read_u32(&buf[4..8])
    } as usize;
    let serial = if big_endian {
        BigEndian::read_u32(&buf[8..12])
    } else {
        LittleEndian::read_u32(&buf[8..12])
    };

    let mut r = Reader::new(buf, big_endian);
    r.pos = 12;
    let fields_len = r.read_u32()? as usize;
    r.skip_padding(8)?;
    let fields_start = r.pos;
    if fields_start + fields_len > buf.len() {
        return Ok(None);
    }
    let fields_end = fields_start + fields_len;

    let mut fields = Fields::default();
    while r.pos < fields_end {
        r.skip_padding(8)?;
        let code = r.read_u8()?;
        let sig = r.read_signature_str()?;
        let value = r.read_value(&sig)?;
        match code {
            HEADER_FIELD_PATH => fields.path = value.as_str().map(str::to_owned),
            HEADER_FIELD_INTERFACE => fields.interface = value.as_str().map(str::to_owned),
            HEADER_FIELD_MEMBER => fields.member = value.as_str().map(str::to_owned),
            HEADER_FIELD_ERROR_NAME => fields.error_name = value.as_str().map(str::to_owned),
            HEADER_FIELD_REPLY_SERIAL => fields.reply_serial = value.as_u32(),
            HEADER_FIELD_DESTINATION => fields.destination = value.as_str().map(str::to_owned),
            HEADER_FIELD_SENDER => fields.sender = value.as_str().map(str::to_owned),
            HEADER_FIELD_SIGNATURE => fields.signature = value.as_str().map(str::to_owned),
            HEADER_FIELD_UNIX_FDS => fields.unix_fds = value.as_u32(),
            _ => {}
        }
    }
    r.pos = fields_end;
    r.skip_padding(8)?;

    let body_start = r.pos;
    if body_start + body_length > buf.len() {
        return Ok(None);
    }
    r.pos = body_start;
    let body_sig = fields.signature.clone().unwrap_or_default();
    let mut body = Vec::new();
    for field_sig in split_struct_signature(&body_sig) {
        body.push(r.read_value(&field_sig)?);
    }

    let consumed = body_start + body_length;
    let msg = Message {
        primary: PrimaryHeader {
            endian,
            msg_type,
            flags,
            protocol_version,
            body_length: body_length as u32,
            serial,
        },
        fields,
        body,
    };
    Ok(Some((msg, consumed)))
}

/// Scan `buf` for a `\r\n`-terminated ASCII line, used during the SASL handshake.
///
/// Returns the line (without the terminator) and the number of bytes it occupies
/// including the terminator, or `None` if no full line is present yet.
pub fn read_line(buf: &[u8]) -> Option<(String, usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    Some((line, pos + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_method_call_with_string_body() {
        let mut msg = Message::method_call(
            "/org/example/Obj",
            Some("org.example.Iface"),
            Some("org.example.Dest"),
            "DoThing",
            vec![Value::Str("hello".into()), Value::U32(99)],
        );
        msg.fields.sender = Some(":1.42".into());
        msg.primary.serial = 7;

        let bytes = encode(&msg).unwrap();
        let (decoded, consumed) = try_decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.member(), Some("DoThing"));
        assert_eq!(decoded.path(), Some("/org/example/Obj"));
        assert_eq!(decoded.sender(), Some(":1.42"));
        assert_eq!(decoded.serial(), 7);
        assert_eq!(decoded.body.len(), 2);
        assert_eq!(decoded.body[0], Value::Str("hello".into()));
        assert_eq!(decoded.body[1], Value::U32(99));
    }

    #[test]
    fn incomplete_buffer_returns_none_without_consuming() {
        let msg = Message::method_call("/o", None, None, "M", vec![]);
        let bytes = encode(&msg).unwrap();
        let partial = &bytes[..bytes.len() - 1];
        assert!(try_decode(partial).unwrap().is_none());
    }

    #[test]
    fn too_short_for_primary_header_returns_none() {
        assert!(try_decode(&[0u8; 4]).unwrap().is_none());
    }

    #[test]
    fn read_line_finds_crlf_terminated_line() {
        let buf = b"OK 1234deadbeef\r\nBEGIN";
        let (line, consumed) = read_line(buf).unwrap();
        assert_eq!(line, "OK 1234deadbeef");
        assert_eq!(consumed, line.len() + 2);
    }

    #[test]
    fn read_line_without_terminator_is_none() {
        assert!(read_line(b"no terminator here").is_none());
    }

    #[test]
    fn array_of_strings_round_trips() {
        let mut msg = Message::signal(
            "/o",
            "org.example.Iface",
            "Names",
            vec![Value::Array(
                "s".into(),
                vec![Value::Str("a".into()), Value::Str("bb".into())],
            )],
        );
        msg.primary.serial = 1;
        let bytes = encode(&msg).unwrap();
        let (decoded, _) = try_decode(&bytes).unwrap().unwrap();
        assert_eq!(
            decoded.body[0],
            Value::Array("s".into(), vec![Value::Str("a".into()), Value::Str("bb".into())])
        );
    }
}
