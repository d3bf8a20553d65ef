use std::rc::Rc;

use futures_lite::io::{AsyncReadExt, AsyncWriteExt};

use crate::fdo;
use crate::guid::Guid;
use crate::message::{codec, Message};
use crate::value::Value;
use crate::{Error, Result};

use super::inner::{require_socket, ConnectionInner};

/// The match rules the handshake installs to drive the name-owner cache. `close` removes
/// exactly these three rules.
pub(super) const BOOTSTRAP_MATCH_RULES: [&str; 3] = [
    "type='signal',interface='org.freedesktop.DBus',member='NameAcquired'",
    "type='signal',interface='org.freedesktop.DBus',member='NameLost'",
    "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
];

/// Perform the SASL EXTERNAL handshake, the `Hello` bootstrap call, and the internal
/// name-owner-tracking subscriptions. Called at most once per connection, under
/// `connect_lock`.
pub async fn perform(inner: &Rc<ConnectionInner>) -> Result<()> {
    sasl_external(inner).await?;
    hello(inner).await?;
    subscribe_name_tracking(inner).await?;
    Ok(())
}

async fn sasl_external(inner: &Rc<ConnectionInner>) -> Result<()> {
    let uid = nix::unistd::Uid::current().as_raw();
    let hex_uid = uid
        .to_string()
        .bytes()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    let auth_line = format!("AUTH EXTERNAL {}\r\n", hex_uid);

    {
        let mut socket = inner.socket.lock().await;
        let socket = require_socket(&mut socket)?;
        socket.write_all(&[0u8]).await?;
        socket.write_all(auth_line.as_bytes()).await?;
    }

    let line = read_line(inner).await?;
    if !line.starts_with("OK ") {
        return Err(Error::Handshake(format!(
            "expected OK from server, got {:?}",
            line
        )));
    }
    let guid_hex = line[3..].trim();
    if let Some(guid) = Guid::from_hex(guid_hex) {
        tracing::debug!(guid = %guid, "handshake: server accepted AUTH EXTERNAL");
        let _ = inner.server_guid.set(guid);
    } else {
        tracing::debug!(guid = %guid_hex, "handshake: server accepted AUTH EXTERNAL (unparseable guid)");
    }

    {
        let mut socket = inner.socket.lock().await;
        require_socket(&mut socket)?.write_all(b"BEGIN\r\n").await?;
    }
    Ok(())
}

/// Read one `\r\n`-terminated line from the socket, buffering partial reads in
/// `read_buf` exactly like the binary message path does for frames.
async fn read_line(inner: &Rc<ConnectionInner>) -> Result<String> {
    loop {
        if let Some((line, consumed)) = codec::read_line(&inner.read_buf.borrow()) {
            inner.read_buf.borrow_mut().drain(..consumed);
            return Ok(line);
        }
        let mut chunk = [0u8; 256];
        let n = {
            let mut socket = inner.socket.lock().await;
            require_socket(&mut socket)?.read(&mut chunk).await?
        };
        if n == 0 {
            return Err(Error::Handshake("connection closed during handshake".into()));
        }
        inner.read_buf.borrow_mut().extend_from_slice(&chunk[..n]);
    }
}

async fn hello(inner: &Rc<ConnectionInner>) -> Result<()> {
    let msg = Message::method_call(
        fdo::BUS_PATH,
        Some(fdo::BUS_INTERFACE),
        Some(fdo::BUS_DESTINATION),
        fdo::member::HELLO,
        vec![],
    );
    let (_, rx) = inner.send_with_reply(msg).await?;
    let reply = inner.recv(&rx).await?;
    let body = reply.map_err(Error::from)?;
    let unique_name = body
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("Hello did not return a unique name".into()))?
        .to_owned();
    tracing::debug!(unique_name = %unique_name, "handshake: Hello complete");
    inner
        .unique_name
        .set(unique_name)
        .map_err(|_| Error::Protocol("unique name set twice".into()))?;
    Ok(())
}

async fn subscribe_name_tracking(inner: &Rc<ConnectionInner>) -> Result<()> {
    for rule in [
        "type='signal',interface='org.freedesktop.DBus',member='NameAcquired'",
        "type='signal',interface='org.freedesktop.DBus',member='NameLost'",
        "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
    ] {
        let msg = Message::method_call(
            fdo::BUS_PATH,
            Some(fdo::BUS_INTERFACE),
            Some(fdo::BUS_DESTINATION),
            fdo::member::ADD_MATCH,
            vec![Value::Str(rule.to_owned())],
        );
        let (_, rx) = inner.send_with_reply(msg).await?;
        let reply = inner.recv(&rx).await?;
        reply.map_err(Error::from)?;
    }
    Ok(())
}
