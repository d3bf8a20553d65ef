use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use enumflags2::BitFlags;

use crate::address::Address;
use crate::fdo;
use crate::message::Message;
use crate::object_tree::Interface;
use crate::value::Value;
use crate::{Error, Result};

use super::inner::ConnectionInner;
use super::names::{self, RequestNameFlags};
use super::subscription::{self, SignalFilter, SignalSubscription};
use crate::fdo::{ReleaseNameReply, RequestNameReply};

/// A connection to a D-Bus bus, or a direct peer.
///
/// Cloning a `Connection` is cheap: the underlying state lives in a single `Rc` and is
/// shared, not duplicated. A `Connection` (and everything reachable from it) is
/// confined to the thread that created it -- it is neither `Send` nor `Sync`.
#[derive(Clone, Debug)]
pub struct Connection(Rc<ConnectionInner>);

impl Connection {
    /// Open a connection to the bus at `address`, without opening the socket or
    /// performing the handshake yet. Both happen lazily on the first operation that
    /// needs the wire.
    pub fn new(address: &str) -> Result<Self> {
        let parsed = Address::parse(address)?;
        let inner = ConnectionInner::new(address.to_owned(), parsed);
        Ok(Connection(inner))
    }

    /// Connect to the session bus.
    pub fn session() -> Result<Self> {
        let address = Address::session()?;
        let inner = ConnectionInner::new("session".to_owned(), address);
        Ok(Connection(inner))
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        let address = Address::system()?;
        let inner = ConnectionInner::new("system".to_owned(), address);
        Ok(Connection(inner))
    }

    /// Open the socket and run the handshake if neither has happened yet. Idempotent
    /// and serialized: a second caller while the first is mid-handshake simply awaits
    /// the first's completion.
    async fn ensure_connected(&self) -> Result<()> {
        if self.0.closed.get() {
            return Err(Error::Usage("connection is closed".into()));
        }
        if self.0.unique_name.get().is_some() {
            return Ok(());
        }
        let _guard = self.0.connect_lock.lock().await;
        if self.0.unique_name.get().is_some() {
            return Ok(());
        }
        let _span = self.0.span().entered();
        self.0.ensure_socket().await?;
        super::handshake::perform(&self.0).await
    }

    /// Close the connection: remove the internal name-tracking match rules, fail any
    /// pending calls, and shut down the socket. Idempotent -- closing an already-closed
    /// connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.0.closed.replace(true) {
            return Ok(());
        }

        if self.0.unique_name.get().is_some() {
            for rule in super::handshake::BOOTSTRAP_MATCH_RULES {
                if let Err(e) = subscription::remove_match(&self.0, rule).await {
                    tracing::warn!(rule, error = %e, "protocol error: failed to remove bootstrap match rule on close");
                }
            }
        }

        self.0
            .fail_all_pending(Error::Usage("connection closed".into()));

        let mut socket = self.0.socket.lock().await;
        if let Some(stream) = socket.take() {
            if let Err(e) = stream.get_ref().shutdown(std::net::Shutdown::Both) {
                tracing::warn!(error = %e, "protocol error: socket shutdown failed on close");
            }
        }
        Ok(())
    }

    pub fn unique_name(&self) -> Option<String> {
        self.0.unique_name.get().cloned()
    }

    pub fn owned_names(&self) -> HashSet<String> {
        self.0.owned_names.borrow().clone()
    }

    /// A broadcast stream of names this connection has newly acquired.
    pub fn name_acquired(&self) -> async_broadcast::Receiver<String> {
        self.0.name_acquired_rx.activate_cloned()
    }

    /// A broadcast stream of names this connection has lost.
    pub fn name_lost(&self) -> async_broadcast::Receiver<String> {
        self.0.name_lost_rx.activate_cloned()
    }

    pub async fn request_name(
        &self,
        name: &str,
        flags: BitFlags<RequestNameFlags>,
    ) -> Result<RequestNameReply> {
        self.ensure_connected().await?;
        names::request_name(&self.0, name, flags).await
    }

    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        self.ensure_connected().await?;
        names::release_name(&self.0, name).await
    }

    pub async fn list_queued_owners(&self, name: &str) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let body = self
            .bus_call(fdo::member::LIST_QUEUED_OWNERS, vec![Value::Str(name.to_owned())])
            .await?;
        string_array(&body, "ListQueuedOwners")
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let body = self.bus_call(fdo::member::LIST_NAMES, vec![]).await?;
        string_array(&body, "ListNames")
    }

    pub async fn list_activatable_names(&self) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let body = self
            .bus_call(fdo::member::LIST_ACTIVATABLE_NAMES, vec![])
            .await?;
        string_array(&body, "ListActivatableNames")
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        self.ensure_connected().await?;
        let body = self
            .bus_call(fdo::member::NAME_HAS_OWNER, vec![Value::Str(name.to_owned())])
            .await?;
        match body.get(0) {
            Some(Value::Bool(b)) => Ok(*b),
            _ => {
                tracing::warn!(body = ?body, "protocol error: NameHasOwner did not return a bool");
                Err(Error::Protocol("NameHasOwner did not return a bool".into()))
            }
        }
    }

    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        self.ensure_connected().await?;
        names::get_name_owner(&self.0, name).await
    }

    pub async fn get_id(&self) -> Result<String> {
        self.ensure_connected().await?;
        let body = self.bus_call(fdo::member::GET_ID, vec![]).await?;
        body.get(0).and_then(Value::as_str).map(str::to_owned).ok_or_else(|| {
            tracing::warn!(body = ?body, "protocol error: GetId did not return a string");
            Error::Protocol("GetId did not return a string".into())
        })
    }

    pub async fn ping(&self, destination: &str) -> Result<()> {
        self.ensure_connected().await?;
        self.call_method(Some(destination), fdo::BUS_PATH, Some(fdo::PEER_INTERFACE), fdo::member::PING, vec![])
            .await?;
        Ok(())
    }

    pub async fn get_machine_id(&self, destination: &str) -> Result<String> {
        self.ensure_connected().await?;
        let body = self
            .call_method(
                Some(destination),
                fdo::BUS_PATH,
                Some(fdo::PEER_INTERFACE),
                fdo::member::GET_MACHINE_ID,
                vec![],
            )
            .await?;
        body.get(0).and_then(Value::as_str).map(str::to_owned).ok_or_else(|| {
            tracing::warn!(body = ?body, "protocol error: GetMachineId did not return a string");
            Error::Protocol("GetMachineId did not return a string".into())
        })
    }

    /// Call a remote method and await its reply.
    pub async fn call_method(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.ensure_connected().await?;
        let msg = Message::method_call(path, interface, destination, member, body);
        let (_, rx) = self.0.send_with_reply(msg).await?;
        self.0
            .recv(&rx)
            .await?
            .map_err(Error::from)
    }

    /// Emit a signal from this connection.
    pub async fn emit_signal(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        self.ensure_connected().await?;
        let mut msg = Message::signal(path, interface, member, body);
        msg.fields.destination = destination.map(str::to_owned);
        self.0.send(msg).await?;
        Ok(())
    }

    /// Subscribe to signals matching `filter`. If `filter.sender` names a well-known
    /// name, its current owner is looked up eagerly to warm the resolution cache (best
    /// effort -- early signals may still be missed while the lookup is in flight).
    pub async fn subscribe_signals(&self, filter: SignalFilter) -> Result<SignalSubscription> {
        self.ensure_connected().await?;
        if let Some(sender) = filter.sender.clone() {
            if !sender.starts_with(':') {
                names::prime_name_owner_cache(&self.0, &sender).await;
            }
        }
        subscription::subscribe(&self.0, filter).await
    }

    /// Host `object` at `path`. Returns a usage error if `path` is already hosted.
    pub fn register_object(&self, path: &str, object: Box<dyn Interface>) -> Result<()> {
        if self.0.closed.get() {
            return Err(Error::Usage("connection is closed".into()));
        }
        if !self.0.objects.borrow_mut().register(path, object) {
            return Err(Error::Usage(format!("path {:?} is already hosted", path)));
        }
        Ok(())
    }

    async fn bus_call(&self, member: &str, body: Vec<Value>) -> Result<Vec<Value>> {
        self.call_method(
            Some(fdo::BUS_DESTINATION),
            fdo::BUS_PATH,
            Some(fdo::BUS_INTERFACE),
            member,
            body,
        )
        .await
    }
}

fn string_array(body: &[Value], op: &str) -> Result<Vec<String>> {
    let items = body
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Protocol(format!("{} did not return an array", op)))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::Protocol(format!("{} returned a non-string array element", op)))
        })
        .collect()
}

pub(super) fn connect(address: &Address) -> Result<UnixStream> {
    let path = match address {
        Address::UnixPath(path) => path,
        Address::UnixAbstract(_) => {
            return Err(Error::Unsupported);
        }
    };
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_tree::Interface;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn client_over(stream: UnixStream) -> Connection {
        let target = Address::UnixPath("test".into());
        let socket = async_io::Async::new(stream).unwrap();
        Connection(ConnectionInner::with_socket("test".into(), target, Some(socket)))
    }

    async fn read_line_raw(peer: &mut async_io::Async<UnixStream>, buf: &mut Vec<u8>) {
        use futures_lite::io::AsyncReadExt;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                buf.drain(..pos + 2);
                return;
            }
            let n = peer.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_one_message(peer: &mut async_io::Async<UnixStream>, buf: &mut Vec<u8>) -> Message {
        use futures_lite::io::AsyncReadExt;
        let mut chunk = [0u8; 256];
        loop {
            if let Some((msg, consumed)) = crate::message::codec::try_decode(buf).unwrap() {
                buf.drain(..consumed);
                return msg;
            }
            let n = peer.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_message(peer: &mut async_io::Async<UnixStream>, msg: &Message) {
        use futures_lite::io::AsyncWriteExt;
        let bytes = crate::message::codec::encode(msg).unwrap();
        peer.write_all(&bytes).await.unwrap();
    }

    /// Drives the server side of the handshake -- AUTH EXTERNAL / OK / BEGIN, the Hello
    /// call, and the three internal name-tracking AddMatch calls -- and hands back the
    /// still-open peer socket so a test can keep scripting further exchanges on it.
    async fn fake_bus_handshake(peer: UnixStream) -> (async_io::Async<UnixStream>, Vec<u8>) {
        use futures_lite::io::AsyncWriteExt;
        let mut peer = async_io::Async::new(peer).unwrap();
        let mut buf = Vec::new();

        read_line_raw(&mut peer, &mut buf).await; // zero byte + AUTH EXTERNAL line
        peer.write_all(b"OK 0000000000000000000000000000beef\r\n")
            .await
            .unwrap();
        read_line_raw(&mut peer, &mut buf).await; // BEGIN

        let hello = read_one_message(&mut peer, &mut buf).await;
        let reply = Message::method_return(&hello, vec![Value::Str(":1.42".into())]);
        write_message(&mut peer, &reply).await;

        for _ in 0..3 {
            let add_match = read_one_message(&mut peer, &mut buf).await;
            let reply = Message::method_return(&add_match, vec![]);
            write_message(&mut peer, &reply).await;
        }

        (peer, buf)
    }

    async fn fake_bus_hello(peer: UnixStream) {
        fake_bus_handshake(peer).await;
    }

    #[test]
    fn connect_performs_handshake_and_records_unique_name() {
        let _ = tracing_subscriber::fmt::try_init();
        let (client, server) = pair();
        let conn = client_over(client);
        pollster::block_on(async {
            let (_, result) = futures_lite::future::zip(fake_bus_hello(server), conn.ensure_connected()).await;
            result.unwrap();
        });
        assert_eq!(conn.unique_name(), Some(":1.42".into()));
    }

    #[test]
    fn request_name_reports_primary_owner() {
        let (client, server) = pair();
        let conn = client_over(client);
        let server_fut = async {
            let (mut peer, mut buf) = fake_bus_handshake(server).await;
            let request = read_one_message(&mut peer, &mut buf).await;
            assert_eq!(request.member(), Some("RequestName"));
            let reply = Message::method_return(&request, vec![Value::U32(1)]);
            write_message(&mut peer, &reply).await;
        };
        let client_fut = conn.request_name("org.example.Svc", BitFlags::empty());
        let (_, result) = pollster::block_on(futures_lite::future::zip(server_fut, client_fut));
        assert!(matches!(result.unwrap(), RequestNameReply::PrimaryOwner));
    }

    #[test]
    fn inbound_call_dispatches_to_hosted_object() {
        let (client, server) = pair();
        let conn = client_over(client);
        conn.register_object("/echo", Box::new(Echo)).unwrap();

        let server_fut = async {
            let (mut peer, mut buf) = fake_bus_handshake(server).await;
            let mut call = Message::method_call(
                "/echo",
                Some("org.example.Echo"),
                None,
                "Echo",
                vec![Value::Str("hi".into())],
            );
            call.primary.serial = 7;
            write_message(&mut peer, &call).await;
            read_one_message(&mut peer, &mut buf).await
        };
        let client_fut = async {
            conn.ensure_connected().await.unwrap();
            for _ in 0..8 {
                if conn.0.drive_once().await.is_err() {
                    break;
                }
            }
        };
        let (reply, _) = pollster::block_on(futures_lite::future::zip(server_fut, client_fut));
        assert_eq!(reply.reply_serial(), Some(7));
        assert_eq!(reply.body, vec![Value::Str("hi".into())]);
    }

    #[test]
    fn inbound_call_to_unknown_path_returns_unknown_object() {
        let (client, server) = pair();
        let conn = client_over(client);

        let server_fut = async {
            let (mut peer, mut buf) = fake_bus_handshake(server).await;
            let mut call = Message::method_call("/nope", None, None, "Whatever", vec![]);
            call.primary.serial = 9;
            write_message(&mut peer, &call).await;
            read_one_message(&mut peer, &mut buf).await
        };
        let client_fut = async {
            conn.ensure_connected().await.unwrap();
            for _ in 0..8 {
                if conn.0.drive_once().await.is_err() {
                    break;
                }
            }
        };
        let (reply, _) = pollster::block_on(futures_lite::future::zip(server_fut, client_fut));
        assert_eq!(reply.error_name(), Some(fdo::error_name::UNKNOWN_OBJECT));
    }

    struct Echo;

    impl Interface for Echo {
        fn interface_name(&self) -> &str {
            "org.example.Echo"
        }

        fn handle_call(
            &self,
            member: &str,
            args: &[Value],
        ) -> std::result::Result<Vec<Value>, (String, Vec<Value>)> {
            match member {
                "Echo" => Ok(args.to_vec()),
                _ => Err((fdo::error_name::UNKNOWN_METHOD.into(), vec![])),
            }
        }
    }

    #[test]
    fn register_object_rejects_duplicate_path() {
        let (client, _server) = pair();
        let conn = client_over(client);
        conn.register_object("/echo", Box::new(Echo)).unwrap();
        assert!(conn.register_object("/echo", Box::new(Echo)).is_err());
    }
}
