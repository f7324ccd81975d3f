//! The full-duplex connection dispatcher.
//!
//! A connection owns its transport and two cooperative tasks: a reader that
//! decodes incoming messages and fans them out to filters, pending-reply
//! slots and signal subscriptions, and a writer that drains the outbound
//! queue.  Dispatcher state is only ever touched behind a non-suspending
//! mutex.

use std::collections::HashMap;
use std::future::Future;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, error, trace, warn};

use crate::address::parse_address_list;
use crate::auth::{self, AuthConfig, Capabilities, Guid};
use crate::error::{name as error_name, Error};
use crate::match_rule::MatchRule;
use crate::message::{
    self, FixedHeader, Message, ProtocolError, FIXED_HEADER_LEN, HEADER_FIELD_DESTINATION,
    MESSAGE_TYPE_ERROR, MESSAGE_TYPE_METHOD_CALL, MESSAGE_TYPE_METHOD_RETURN,
    MESSAGE_TYPE_SIGNAL,
};
use crate::transport::Transport;
use crate::types::{Value, Variant};

const WRITE_QUEUE_DEPTH: usize = 64;

type Filter = Arc<dyn Fn(&Message) + Send + Sync>;
type ReplySlot = oneshot::Sender<Result<Arc<Message>, Error>>;
type DisconnectHook = Box<dyn FnOnce(Error) + Send>;

/// An opaque handle naming an installed filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle(u64);

/// A decoded method call handed to the export registry.
#[derive(Debug)]
pub struct IncomingCall {
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    pub sender: Option<String>,
    pub body: Vec<Value>,
    pub serial: u32,
    pub no_reply: bool,
}

/// One-shot capability to answer a method call.
pub struct ReplyHandle {
    connection: Connection,
    reply_serial: u32,
    destination: Option<String>,
    no_reply: bool,
}

impl ReplyHandle {
    pub async fn send_return(self, args: &[Value]) -> Result<(), Error> {
        if self.no_reply {
            return Ok(());
        }
        let mut reply = message::create_method_return(self.reply_serial);
        if let Some(ref dest) = self.destination {
            reply = reply.add_header(
                HEADER_FIELD_DESTINATION,
                Variant::new(Value::from(dest.as_str()), "s"),
            );
        }
        for arg in args {
            reply = reply.add_arg(arg);
        }
        self.connection.send(reply).await.map(|_| ())
    }

    pub async fn send_error(self, name: &str, text: &str) -> Result<(), Error> {
        if self.no_reply {
            return Ok(());
        }
        let mut reply = message::create_error(name, self.reply_serial)?;
        if let Some(ref dest) = self.destination {
            reply = reply.add_header(
                HEADER_FIELD_DESTINATION,
                Variant::new(Value::from(dest.as_str()), "s"),
            );
        }
        let reply = reply.add_arg(&text);
        self.connection.send(reply).await.map(|_| ())
    }
}

/// The collaborator that owns exported objects.  Invoked by the dispatcher
/// for every incoming method call; returns false when nothing claims the
/// path + interface + member, in which case the dispatcher answers with
/// `org.freedesktop.DBus.Error.UnknownMethod`.
pub trait ExportRegistry: Send {
    fn dispatch(&mut self, call: IncomingCall, reply: ReplyHandle) -> bool;
}

struct SendGate {
    next_serial: u32,
    tx: mpsc::Sender<WriteOp>,
}

impl SendGate {
    fn bump(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        // Zero is never a valid serial, including after wrap.
        if self.next_serial == 0 {
            self.next_serial = 1;
        }
        serial
    }
}

struct WriteOp {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
}

struct DispatchState {
    pending: HashMap<u32, ReplySlot>,
    filters: Vec<(u64, Filter)>,
    next_filter_id: u64,
    subscriptions: Vec<(u64, MatchRule, mpsc::UnboundedSender<Arc<Message>>)>,
    next_subscription_id: u64,
    on_disconnect: Option<DisconnectHook>,
}

struct Inner {
    transport: Arc<Transport>,
    guid: Guid,
    capabilities: Capabilities,
    send_gate: AsyncMutex<SendGate>,
    state: StdMutex<DispatchState>,
    registry: StdMutex<Option<Box<dyn ExportRegistry>>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(true);
    }
}

/// A full-duplex D-Bus connection.  Cheap to clone; the last clone dropped
/// tears the tasks down.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Iterate a candidate address list in order; the first transport that
    /// connects and authenticates wins.
    pub async fn open(addresses: &str) -> Result<Connection, Error> {
        Connection::open_with_config(addresses, &AuthConfig::default()).await
    }

    pub async fn open_with_config(
        addresses: &str,
        config: &AuthConfig,
    ) -> Result<Connection, Error> {
        let list = parse_address_list(addresses)?;
        let mut last = None;
        for addr in &list {
            match Connection::try_open(addr, config).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(?addr, error = %e, "address candidate failed");
                    last = Some(e);
                }
            }
        }
        // parse_address_list never returns an empty list.
        Err(last.unwrap_or(Error::ConnectionClosed))
    }

    async fn try_open(
        addr: &crate::address::ServerAddress,
        config: &AuthConfig,
    ) -> Result<Connection, Error> {
        let transport = Transport::connect(addr).await?;
        let (guid, capabilities) = auth::authenticate_client(&transport, config).await?;
        Ok(Connection::attach(transport, guid, capabilities))
    }

    /// Take ownership of an already-authenticated transport and start the
    /// reader and writer tasks.  Must run inside a tokio runtime.
    pub fn attach(transport: Transport, guid: Guid, capabilities: Capabilities) -> Connection {
        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            transport: transport.clone(),
            guid,
            capabilities,
            send_gate: AsyncMutex::new(SendGate { next_serial: 1, tx }),
            state: StdMutex::new(DispatchState {
                pending: HashMap::new(),
                filters: Vec::new(),
                next_filter_id: 1,
                subscriptions: Vec::new(),
                next_subscription_id: 1,
                on_disconnect: None,
            }),
            registry: StdMutex::new(None),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        tokio::spawn(reader_task(
            transport.clone(),
            Arc::downgrade(&inner),
            closed_rx.clone(),
        ));
        tokio::spawn(writer_task(transport, rx, Arc::downgrade(&inner), closed_rx));
        Connection { inner }
    }

    pub fn server_guid(&self) -> &Guid {
        &self.inner.guid
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Assign the next serial and enqueue the message for the writer.
    /// Resolves once the message is queued; bytes reach the transport in
    /// serial order.
    pub async fn send(&self, msg: Message) -> Result<u32, Error> {
        self.send_inner(msg, None).await
    }

    /// Like [`send`](Connection::send), additionally installing a reply
    /// slot before the message is queued.  Dropping the returned future
    /// deregisters the slot; a late reply is then discarded silently.
    pub async fn send_with_reply(&self, msg: Message) -> Result<PendingReply, Error> {
        let (tx, rx) = oneshot::channel();
        let serial = self.send_inner(msg, Some(tx)).await?;
        Ok(PendingReply {
            serial,
            rx,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Send a method call and wait for its reply.
    pub async fn call(&self, msg: Message) -> Result<Arc<Message>, Error> {
        self.send_with_reply(msg).await?.await
    }

    async fn send_inner(&self, mut msg: Message, slot: Option<ReplySlot>) -> Result<u32, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut gate = self.inner.send_gate.lock().await;
        let serial = gate.bump();
        msg.serial = serial;
        let bytes = msg.encode()?;
        let fds = std::mem::take(&mut msg.fds);

        // The slot must exist before the message can reach the wire.
        let installed = slot.is_some();
        if let Some(slot) = slot {
            self.inner.state().pending.insert(serial, slot);
        }

        if gate.tx.send(WriteOp { bytes, fds }).await.is_err() {
            if installed {
                self.inner.state().pending.remove(&serial);
            }
            return Err(Error::ConnectionClosed);
        }
        trace!(serial, "message queued");
        Ok(serial)
    }

    /// Install an observer that sees every incoming message before any
    /// other routing.  Filters may not reply or mutate.
    pub fn add_filter<F>(&self, filter: F) -> FilterHandle
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut st = self.inner.state();
        let id = st.next_filter_id;
        st.next_filter_id += 1;
        st.filters.push((id, Arc::new(filter)));
        FilterHandle(id)
    }

    pub fn remove_filter(&self, handle: FilterHandle) -> bool {
        let mut st = self.inner.state();
        let before = st.filters.len();
        st.filters.retain(|(id, _)| *id != handle.0);
        st.filters.len() != before
    }

    /// Route every incoming signal matching `rule` to the returned stream.
    /// Dropping the stream removes the subscription.
    pub fn subscribe(&self, rule: MatchRule) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.inner.state();
        let id = st.next_subscription_id;
        st.next_subscription_id += 1;
        st.subscriptions.push((id, rule, tx));
        SignalStream {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Replace the export registry that answers incoming method calls.
    pub fn set_export_registry(&self, registry: Box<dyn ExportRegistry>) {
        *self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(registry);
    }

    /// Replace the handler run exactly once when the connection dies from
    /// a transport or protocol failure.  The default logs the cause.
    pub fn set_on_disconnect<F>(&self, hook: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.inner.state().on_disconnect = Some(Box::new(hook));
    }

    /// Close the connection.  Idempotent: every pending reply and any
    /// later operation fails with `ConnectionClosed`.
    pub async fn close(&self) {
        shutdown(&self.inner, None);
        self.inner.transport.close().await;
    }
}

/// The reply future returned by `send_with_reply`.
pub struct PendingReply {
    serial: u32,
    rx: oneshot::Receiver<Result<Arc<Message>, Error>>,
    inner: Weak<Inner>,
}

impl PendingReply {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Race the reply against a local timer.  On timeout the slot is
    /// deregistered and `TimedOut` is returned.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Arc<Message>, Error> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Arc<Message>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state().pending.remove(&self.serial);
        }
    }
}

/// Stream of signals delivered to one subscription.
pub struct SignalStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<Message>>,
    inner: Weak<Inner>,
}

impl SignalStream {
    /// The next matching signal, or None once the connection is gone.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state().subscriptions.retain(|(id, _, _)| *id != self.id);
        }
    }
}

/// First-failure-wins teardown.  Fails every pending reply, wakes both
/// tasks, and runs the disconnect hook when a cause is given.
fn shutdown(inner: &Arc<Inner>, cause: Option<Error>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let (pending, subscriptions, hook) = {
        let mut st = inner.state();
        (
            std::mem::take(&mut st.pending),
            std::mem::take(&mut st.subscriptions),
            st.on_disconnect.take(),
        )
    };
    for (_, slot) in pending {
        let _ = slot.send(Err(Error::ConnectionClosed));
    }
    // Dropping the senders ends every signal stream.
    drop(subscriptions);
    let _ = inner.closed_tx.send(true);

    match cause {
        Some(cause) => {
            warn!(error = %cause, "connection failed");
            match hook {
                Some(hook) => hook(cause),
                None => error!(error = %cause, "connection lost with no disconnect handler"),
            }
        }
        None => debug!("connection closed"),
    }
}

async fn reader_task(
    transport: Arc<Transport>,
    inner: Weak<Inner>,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut pending_fds: Vec<OwnedFd> = Vec::new();
    loop {
        let result = tokio::select! {
            _ = closed_rx.changed() => return,
            result = read_message(&transport, &mut pending_fds) => result,
        };
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match result {
            Ok(msg) => dispatch(&inner, msg).await,
            Err(err) => {
                // EOF after close() is the expected wind-down, not a fault.
                if !inner.closed.load(Ordering::SeqCst) {
                    shutdown(&inner, Some(err));
                }
                return;
            }
        }
    }
}

async fn read_message(
    transport: &Transport,
    pending_fds: &mut Vec<OwnedFd>,
) -> Result<Message, Error> {
    let mut first = [0u8; FIXED_HEADER_LEN];
    transport.read_exact_with_fds(&mut first, pending_fds).await?;
    let fixed = FixedHeader::parse(&first)?;
    let rest_len = fixed.rest_len()?;

    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + rest_len);
    buf.extend_from_slice(&first);
    buf.resize(FIXED_HEADER_LEN + rest_len, 0);
    transport
        .read_exact_with_fds(&mut buf[FIXED_HEADER_LEN..], pending_fds)
        .await?;

    let mut msg = message::decode(&buf)?;
    let announced = msg.unix_fds().unwrap_or(0) as usize;
    if announced > pending_fds.len() {
        return Err(Error::Protocol(ProtocolError::MissingUnixFds));
    }
    msg.fds = pending_fds.drain(..announced).collect();
    trace!(
        serial = msg.serial,
        kind = msg.message_type.0,
        member = msg.member().unwrap_or(""),
        "message received"
    );
    Ok(msg)
}

/// Routing order: filters, then reply correlation, then signal
/// subscriptions, then the export registry.
async fn dispatch(inner: &Arc<Inner>, msg: Message) {
    let msg = Arc::new(msg);

    let filters: Vec<Filter> = inner
        .state()
        .filters
        .iter()
        .map(|(_, f)| f.clone())
        .collect();
    for filter in filters {
        filter(&msg);
    }

    match msg.message_type {
        MESSAGE_TYPE_METHOD_RETURN | MESSAGE_TYPE_ERROR => {
            let serial = match msg.reply_serial() {
                Some(serial) => serial,
                None => return,
            };
            let slot = inner.state().pending.remove(&serial);
            match slot {
                Some(slot) => {
                    let result = if msg.message_type == MESSAGE_TYPE_ERROR {
                        Err(method_call_error(&msg))
                    } else {
                        Ok(msg.clone())
                    };
                    // A cancelled waiter has dropped its receiver; the
                    // reply is discarded silently.
                    let _ = slot.send(result);
                }
                None => trace!(serial, "reply for unknown or cancelled serial dropped"),
            }
        }
        MESSAGE_TYPE_SIGNAL => {
            let targets: Vec<(u64, mpsc::UnboundedSender<Arc<Message>>)> = inner
                .state()
                .subscriptions
                .iter()
                .filter(|(_, rule, _)| rule.matches(&msg))
                .map(|(id, _, tx)| (*id, tx.clone()))
                .collect();
            let mut dead = Vec::new();
            for (id, tx) in targets {
                if tx.send(msg.clone()).is_err() {
                    dead.push(id);
                }
            }
            if !dead.is_empty() {
                inner
                    .state()
                    .subscriptions
                    .retain(|(id, _, _)| !dead.contains(id));
            }
        }
        MESSAGE_TYPE_METHOD_CALL => handle_method_call(inner, &msg).await,
        _ => {}
    }
}

async fn handle_method_call(inner: &Arc<Inner>, msg: &Arc<Message>) {
    let no_reply = msg.no_reply_expected();
    let call = IncomingCall {
        path: msg.path().unwrap_or("").to_string(),
        interface: msg.interface().map(str::to_string),
        member: msg.member().unwrap_or("").to_string(),
        sender: msg.sender().map(str::to_string),
        // decode() already checked the body against its signature.
        body: msg.get_body().ok().flatten().unwrap_or_default(),
        serial: msg.serial,
        no_reply,
    };
    let connection = Connection {
        inner: inner.clone(),
    };
    let handle = ReplyHandle {
        connection: connection.clone(),
        reply_serial: msg.serial,
        destination: msg.sender().map(str::to_string),
        no_reply,
    };

    let claimed = {
        let mut registry = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.as_mut() {
            Some(registry) => registry.dispatch(call, handle),
            None => false,
        }
    };
    if !claimed && !no_reply {
        let reply = ReplyHandle {
            connection,
            reply_serial: msg.serial,
            destination: msg.sender().map(str::to_string),
            no_reply: false,
        };
        if let Err(e) = reply
            .send_error(error_name::UNKNOWN_METHOD, "no such method")
            .await
        {
            debug!(error = %e, "could not send UnknownMethod reply");
        }
    }
}

fn method_call_error(msg: &Message) -> Error {
    let name = msg
        .error_name()
        .unwrap_or(error_name::FAILED)
        .to_string();
    let text = match msg.get_body() {
        Ok(Some(body)) => match body.first() {
            Some(v) => <&str>::try_from(v).unwrap_or("").to_string(),
            None => String::new(),
        },
        _ => String::new(),
    };
    Error::MethodCall {
        name,
        message: text,
    }
}

async fn writer_task(
    transport: Arc<Transport>,
    mut rx: mpsc::Receiver<WriteOp>,
    inner: Weak<Inner>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        let op = tokio::select! {
            _ = closed_rx.changed() => return,
            op = rx.recv() => match op {
                Some(op) => op,
                None => return,
            },
        };
        let raw: Vec<RawFd> = op.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let result = if raw.is_empty() {
            transport.write_all(&op.bytes).await
        } else {
            transport.write_all_with_fds(&op.bytes, &raw).await
        };
        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                shutdown(&inner, Some(Error::Transport(e)));
            }
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{create_method_call, create_method_return, create_signal};
    use std::sync::atomic::AtomicUsize;

    fn attach_pair() -> (Connection, Transport) {
        let (ours, theirs) = Transport::pair();
        let conn = Connection::attach(ours, Guid::generate(), Capabilities::default());
        (conn, theirs)
    }

    async fn peer_read(t: &Transport) -> Message {
        let mut first = [0u8; FIXED_HEADER_LEN];
        t.read_exact(&mut first).await.unwrap();
        let fixed = FixedHeader::parse(&first).unwrap();
        let rest = fixed.rest_len().unwrap();
        let mut buf = first.to_vec();
        buf.resize(FIXED_HEADER_LEN + rest, 0);
        t.read_exact(&mut buf[FIXED_HEADER_LEN..]).await.unwrap();
        message::decode(&buf).unwrap()
    }

    async fn peer_send(t: &Transport, mut msg: Message, serial: u32) {
        msg.serial = serial;
        t.write_all(&msg.encode().unwrap()).await.unwrap();
    }

    fn some_call(member: &str) -> Message {
        create_method_call("org.example.Peer", "/org/example", "org.example.Iface", member)
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_order_and_serials() {
        let (conn, peer) = attach_pair();
        let s1 = conn.send(some_call("One")).await.unwrap();
        let s2 = conn.send(some_call("Two")).await.unwrap();
        assert!(s1 < s2);

        let m1 = peer_read(&peer).await;
        let m2 = peer_read(&peer).await;
        assert_eq!(m1.member(), Some("One"));
        assert_eq!(m1.serial, s1);
        assert_eq!(m2.member(), Some("Two"));
        assert_eq!(m2.serial, s2);
    }

    #[tokio::test]
    async fn test_reply_correlation_out_of_order() {
        let (conn, peer) = attach_pair();
        let pr1 = conn.send_with_reply(some_call("First")).await.unwrap();
        let pr2 = conn.send_with_reply(some_call("Second")).await.unwrap();
        let (s1, s2) = (pr1.serial(), pr2.serial());

        let _ = peer_read(&peer).await;
        let _ = peer_read(&peer).await;

        // Replies arrive in reverse order; each future still resolves to
        // the return whose reply_serial matches its call.
        peer_send(&peer, create_method_return(s2).add_arg(&"two"), 100).await;
        peer_send(&peer, create_method_return(s1).add_arg(&"one"), 101).await;

        let r2 = pr2.await.unwrap();
        assert_eq!(r2.reply_serial(), Some(s2));
        let body = r2.get_body().unwrap().unwrap();
        assert_eq!(body[0], Value::from("two"));

        let r1 = pr1.await.unwrap();
        assert_eq!(r1.reply_serial(), Some(s1));
    }

    #[tokio::test]
    async fn test_error_reply_becomes_method_call_error() {
        let (conn, peer) = attach_pair();
        let pr = conn.send_with_reply(some_call("Boom")).await.unwrap();
        let serial = pr.serial();
        let _ = peer_read(&peer).await;

        let err_msg = message::create_error("org.example.Error.Kaput", serial)
            .unwrap()
            .add_arg(&"it broke");
        peer_send(&peer, err_msg, 7).await;

        match pr.await.unwrap_err() {
            Error::MethodCall { name, message } => {
                assert_eq!(name, "org.example.Error.Kaput");
                assert_eq!(message, "it broke");
            }
            other => panic!("expected a method call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_slot_drops_reply() {
        let (conn, peer) = attach_pair();
        let pr1 = conn.send_with_reply(some_call("Cancelled")).await.unwrap();
        let s1 = pr1.serial();
        drop(pr1);

        let pr2 = conn.send_with_reply(some_call("Kept")).await.unwrap();
        let s2 = pr2.serial();
        let _ = peer_read(&peer).await;
        let _ = peer_read(&peer).await;

        // The late reply for the cancelled slot is discarded; the live one
        // still resolves.
        peer_send(&peer, create_method_return(s1), 41).await;
        peer_send(&peer, create_method_return(s2), 42).await;
        let reply = pr2.await.unwrap();
        assert_eq!(reply.reply_serial(), Some(s2));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_pending() {
        let (conn, _peer) = attach_pair();
        let pr = conn.send_with_reply(some_call("Never")).await.unwrap();
        conn.close().await;
        conn.close().await;

        assert!(matches!(pr.await.unwrap_err(), Error::ConnectionClosed));
        assert!(matches!(
            conn.send(some_call("After")).await.unwrap_err(),
            Error::ConnectionClosed
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_protocol_error_is_fatal_and_hook_runs_once() {
        let (conn, peer) = attach_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            conn.set_on_disconnect(move |cause| {
                assert!(matches!(cause, Error::Protocol(_)));
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        let pr = conn.send_with_reply(some_call("Doomed")).await.unwrap();
        let _ = peer_read(&peer).await;

        // An invalid endianness byte wrecks the stream.
        let mut junk = [0u8; 16];
        junk[0] = b'x';
        peer.write_all(&junk).await.unwrap();

        assert!(matches!(pr.await.unwrap_err(), Error::ConnectionClosed));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_filters_and_signal_routing() {
        let (conn, peer) = attach_pair();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            conn.add_filter(move |msg| {
                seen.lock().unwrap().push(msg.serial);
            });
        }
        let mut stream = conn.subscribe(MatchRule::new().member("Changed"));
        let mut other = conn.subscribe(MatchRule::new().member("Unrelated"));

        let sig = create_signal("/org/example", "org.example.Iface", "Changed")
            .unwrap()
            .add_arg(&"payload");
        peer_send(&peer, sig, 9).await;

        let got = stream.recv().await.unwrap();
        assert_eq!(got.member(), Some("Changed"));
        assert_eq!(seen.lock().unwrap().as_slice(), &[9]);

        // The non-matching subscription saw nothing.
        conn.close().await;
        assert!(other.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_removed_filter_stops_observing() {
        let (conn, peer) = attach_pair();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = count.clone();
            conn.add_filter(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut stream = conn.subscribe(MatchRule::new().member("Tick"));

        peer_send(
            &peer,
            create_signal("/t", "org.example.T", "Tick").unwrap(),
            1,
        )
        .await;
        stream.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(conn.remove_filter(handle));
        assert!(!conn.remove_filter(handle));
        peer_send(
            &peer,
            create_signal("/t", "org.example.T", "Tick").unwrap(),
            2,
        )
        .await;
        stream.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unclaimed_method_call_gets_unknown_method() {
        let (conn, peer) = attach_pair();
        let _keepalive = conn.clone();

        let call = create_method_call(":1.7", "/org/example", "org.example.Iface", "Nope")
            .unwrap()
            .add_header(
                crate::message::HEADER_FIELD_SENDER,
                Variant::new(Value::from(":1.9"), "s"),
            );
        peer_send(&peer, call, 55).await;

        let reply = peer_read(&peer).await;
        assert_eq!(reply.message_type, MESSAGE_TYPE_ERROR);
        assert_eq!(reply.reply_serial(), Some(55));
        assert_eq!(reply.error_name(), Some(error_name::UNKNOWN_METHOD));
        assert_eq!(reply.destination(), Some(":1.9"));
    }

    struct PingRegistry;

    impl ExportRegistry for PingRegistry {
        fn dispatch(&mut self, call: IncomingCall, reply: ReplyHandle) -> bool {
            if call.member != "Ping" {
                return false;
            }
            tokio::spawn(async move {
                reply.send_return(&[Value::from("pong")]).await.unwrap();
            });
            true
        }
    }

    #[tokio::test]
    async fn test_export_registry_answers() {
        let (conn, peer) = attach_pair();
        conn.set_export_registry(Box::new(PingRegistry));

        let call = create_method_call(":1.7", "/org/example", "org.example.Iface", "Ping").unwrap();
        peer_send(&peer, call, 77).await;

        let reply = peer_read(&peer).await;
        assert_eq!(reply.message_type, MESSAGE_TYPE_METHOD_RETURN);
        assert_eq!(reply.reply_serial(), Some(77));
        let body = reply.get_body().unwrap().unwrap();
        assert_eq!(body[0], Value::from("pong"));
    }

    #[tokio::test]
    async fn test_reply_timeout_deregisters() {
        let (conn, peer) = attach_pair();
        let pr = conn.send_with_reply(some_call("Slow")).await.unwrap();
        let serial = pr.serial();
        let _ = peer_read(&peer).await;

        let err = pr.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut));

        // A reply arriving after the timeout is dropped without effect.
        peer_send(&peer, create_method_return(serial), 5).await;
        let s = conn.send(some_call("StillAlive")).await.unwrap();
        let m = peer_read(&peer).await;
        assert_eq!(m.serial, s);
    }
}
