use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use async_io::Async;
use async_lock::Mutex as AsyncMutex;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use once_cell::unsync::OnceCell;

use crate::address::Address;
use crate::guid::Guid;
use crate::message::{codec, Message};
use crate::object_tree::ObjectTree;
use crate::value::Value;
use crate::{Error, Result};

use super::subscription::SubscriptionEntry;

/// Why a pending method call's slot was failed instead of receiving `Ok`.
///
/// Kept distinct from a success value all the way to the caller so a genuine remote
/// `Error` reply (§7 "remote method error") is never confused with the connection itself
/// going away mid-call (§7 "transport error") -- both end up in the same channel, but as
/// different variants.
#[derive(Debug, Clone)]
pub enum PendingFailure {
    /// The bus replied with an `Error` message: error name plus its argument values.
    Remote { name: String, body: Vec<Value> },
    /// The call never got a reply because the transport closed or failed.
    Transport(String),
}

impl From<PendingFailure> for Error {
    fn from(failure: PendingFailure) -> Self {
        match failure {
            PendingFailure::Remote { name, body } => Error::MethodError { name, body },
            PendingFailure::Transport(message) => Error::Transport(message),
        }
    }
}

/// A one-shot reply slot for a pending method call: `Ok` for `MethodReturn`, `Err` for
/// either a remote `Error` message or a transport failure.
pub type PendingReply = std::result::Result<Vec<Value>, PendingFailure>;

const READ_CHUNK: usize = 4096;

#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct ConnectionInner {
    pub address: String,
    /// Where to open the socket on the first operation that needs the wire. Unused once
    /// `socket` already holds a stream (either opened lazily from this, or supplied
    /// directly at construction for a connection that already has a live peer).
    pub target: Address,

    #[derivative(Debug = "ignore")]
    pub socket: AsyncMutex<Option<Async<UnixStream>>>,
    pub connect_lock: AsyncMutex<()>,

    pub unique_name: OnceCell<String>,
    pub server_guid: OnceCell<Guid>,

    pub serial: Cell<u32>,
    pub read_buf: RefCell<Vec<u8>>,

    #[derivative(Debug = "ignore")]
    pub pending_replies: RefCell<HashMap<u32, async_channel::Sender<PendingReply>>>,

    pub subscriptions: RefCell<Vec<Rc<SubscriptionEntry>>>,
    pub match_rule_refs: RefCell<HashMap<String, u32>>,
    /// Rules whose refcount hit zero from a `Drop` (not an explicit `cancel`), queued for
    /// a `RemoveMatch` call the next time something drives the connection.
    pub pending_match_removals: RefCell<Vec<String>>,

    pub name_owners: RefCell<HashMap<String, String>>,
    pub owned_names: RefCell<std::collections::HashSet<String>>,

    #[derivative(Debug = "ignore")]
    pub name_acquired_tx: async_broadcast::Sender<String>,
    #[derivative(Debug = "ignore")]
    pub name_acquired_rx: async_broadcast::InactiveReceiver<String>,
    #[derivative(Debug = "ignore")]
    pub name_lost_tx: async_broadcast::Sender<String>,
    #[derivative(Debug = "ignore")]
    pub name_lost_rx: async_broadcast::InactiveReceiver<String>,

    pub objects: RefCell<ObjectTree>,
    pub closed: Cell<bool>,
}

impl ConnectionInner {
    /// Build a connection in the disconnected state: no socket is opened yet. `target` is
    /// consulted by `Connection::ensure_connected` the first time the wire is needed.
    pub fn new(address: String, target: Address) -> Rc<Self> {
        Self::with_socket(address, target, None)
    }

    /// Build a connection already wrapping an open `stream` (e.g. one side of a
    /// `UnixStream::pair`, or a socket a caller accepted itself). `ensure_connected` skips
    /// straight to the handshake since the transport is already live.
    pub fn with_socket(address: String, target: Address, stream: Option<Async<UnixStream>>) -> Rc<Self> {
        let (mut acquired_tx, acquired_rx) = async_broadcast::broadcast(16);
        let (mut lost_tx, lost_rx) = async_broadcast::broadcast(16);
        acquired_tx.set_overflow(true);
        lost_tx.set_overflow(true);

        Rc::new(ConnectionInner {
            address,
            target,
            socket: AsyncMutex::new(stream),
            connect_lock: AsyncMutex::new(()),
            unique_name: OnceCell::new(),
            server_guid: OnceCell::new(),
            serial: Cell::new(0),
            read_buf: RefCell::new(Vec::new()),
            pending_replies: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(Vec::new()),
            match_rule_refs: RefCell::new(HashMap::new()),
            pending_match_removals: RefCell::new(Vec::new()),
            name_owners: RefCell::new(HashMap::new()),
            owned_names: RefCell::new(std::collections::HashSet::new()),
            name_acquired_tx: acquired_tx,
            name_acquired_rx: acquired_rx.deactivate(),
            name_lost_tx: lost_tx,
            name_lost_rx: lost_rx.deactivate(),
            objects: RefCell::new(ObjectTree::new()),
            closed: Cell::new(false),
        })
    }

    /// Open the transport if it isn't already, from `target`. A no-op if a socket is
    /// already present (supplied at construction, or opened by an earlier call).
    pub async fn ensure_socket(&self) -> Result<()> {
        let mut socket = self.socket.lock().await;
        if socket.is_some() {
            return Ok(());
        }
        let stream = super::api::connect(&self.target)?;
        *socket = Some(Async::new(stream)?);
        Ok(())
    }

    pub fn next_serial(&self) -> u32 {
        let next = self.serial.get() + 1;
        self.serial.set(next);
        next
    }

    /// Send one message, assigning it a fresh serial first.
    pub async fn send(&self, mut msg: Message) -> Result<u32> {
        let serial = self.next_serial();
        msg.primary.serial = serial;
        let bytes = codec::encode(&msg)?;
        tracing::trace!(serial, kind = ?msg.message_type(), "sending message");
        let mut socket = self.socket.lock().await;
        require_socket(&mut socket)?.write_all(&bytes).await?;
        Ok(serial)
    }

    /// Send a message and register a pending-reply slot for its serial before returning.
    pub async fn send_with_reply(
        &self,
        mut msg: Message,
    ) -> Result<(u32, async_channel::Receiver<PendingReply>)> {
        let serial = self.next_serial();
        msg.primary.serial = serial;
        let (tx, rx) = async_channel::bounded(1);
        self.pending_replies.borrow_mut().insert(serial, tx);
        let bytes = codec::encode(&msg)?;
        tracing::trace!(serial, member = ?msg.member(), "sending method call");
        let mut socket = self.socket.lock().await;
        let write_result = match require_socket(&mut socket) {
            Ok(s) => s.write_all(&bytes).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = write_result {
            drop(socket);
            self.pending_replies.borrow_mut().remove(&serial);
            return Err(e);
        }
        Ok((serial, rx))
    }

    /// Read whatever bytes are available and dispatch every complete message found.
    /// Holds the socket lock for the duration so concurrently-awaiting callers take
    /// turns driving I/O rather than racing reads against each other.
    pub async fn drive_once(self: &Rc<Self>) -> Result<()> {
        super::subscription::flush_pending_removals(self).await?;

        let mut socket = self.socket.lock().await;
        let mut chunk = [0u8; READ_CHUNK];
        let n = require_socket(&mut socket)?.read(&mut chunk).await?;
        drop(socket);
        if n == 0 {
            self.fail_all_pending(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "bus connection closed",
            )));
            self.closed.set(true);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "bus connection closed",
            )));
        }
        self.read_buf.borrow_mut().extend_from_slice(&chunk[..n]);

        loop {
            let decoded = {
                let buf = self.read_buf.borrow();
                codec::try_decode(&buf)?
            };
            match decoded {
                Some((msg, consumed)) => {
                    self.read_buf.borrow_mut().drain(..consumed);
                    super::dispatch::route(self, msg).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Fail every pending method call with `err` (stringified, since `Error` itself isn't
    /// `Clone`) and clear the table.
    pub fn fail_all_pending(&self, err: Error) {
        let message = err.to_string();
        let pending: Vec<_> = self.pending_replies.borrow_mut().drain().collect();
        for (serial, tx) in pending {
            tracing::warn!(serial, error = %message, "failing pending call: transport closed");
            let _ = tx.try_send(Err(PendingFailure::Transport(message.clone())));
        }
    }

    /// Wait for a one-shot reply, driving socket I/O ourselves in between checks.
    ///
    /// There is no separate reader task in this single-threaded cooperative model: the
    /// future that wants an answer is the one that polls the socket for it, under the
    /// shared `socket` lock so concurrently-awaiting callers take turns rather than race.
    pub async fn recv<T>(self: &Rc<Self>, rx: &async_channel::Receiver<T>) -> Result<T> {
        loop {
            match rx.try_recv() {
                Ok(v) => return Ok(v),
                Err(async_channel::TryRecvError::Closed) => {
                    return Err(Error::Usage("reply channel closed before reply arrived".into()))
                }
                Err(async_channel::TryRecvError::Empty) => {
                    self.drive_once().await?;
                }
            }
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::debug_span!("connection", address = %self.address)
    }
}

/// Every socket access goes through this: once `ensure_connected` has run, the slot is
/// always occupied, but nothing in the type system enforces that, so every use site gets
/// a real `Error` instead of a panic if it's ever called too early.
pub(super) fn require_socket(socket: &mut Option<Async<UnixStream>>) -> Result<&mut Async<UnixStream>> {
    socket
        .as_mut()
        .ok_or_else(|| Error::Usage("connection is not open yet".into()))
}
