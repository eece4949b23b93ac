//! Connection actor for a single Memcached server.
//!
//! [`MemcachedConnection`] is a cheaply-cloneable handle. Command methods
//! enqueue `(request, reply slot)` pairs onto an unbounded queue; the
//! [`run`](MemcachedConnection::run) task owns the socket and is the only
//! reader and writer, serving the queue strictly in order: write one
//! request, await exactly one response, resume the matching reply slot.
//! The meta protocol carries no correlation ids, so ordering on the wire
//! is the correlation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use protocol_meta::{
    ArithmeticMode, MetaBuf, MetaFlags, MetaValue, Request, Response, ResponseDecoder, ReturnCode,
    StorageMode, TimeToLive,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, debug_span, trace, Instrument};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

const RECV_BUFFER_SIZE: usize = 4096;
const SEND_BUFFER_SIZE: usize = 1024;

type ReplySlot = oneshot::Sender<Result<Response>>;
type RequestEntry = (Request, ReplySlot);

/// Lifecycle of a connection. `Finished` is absorbing.
enum Lifecycle {
    /// Created, not yet running. Holds everything `run()` needs.
    Initial {
        config: ConnectionConfig,
        requests: mpsc::UnboundedReceiver<RequestEntry>,
    },
    /// `run()` owns the socket and is serving the queue.
    Running,
    /// Terminated; every submission fails with `ConnectionShutdown`.
    Finished,
}

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

struct StateSlot {
    lifecycle: Lifecycle,
    on_close: Vec<CloseCallback>,
}

struct Shared {
    request_tx: mpsc::UnboundedSender<RequestEntry>,
    state: Mutex<StateSlot>,
    /// Set by `close()`; checked on every submission and loop turn.
    closing: AtomicBool,
    /// Wakes the driver when `close()` is called.
    shutdown: Notify,
    /// Flips to `true` exactly once, when the connection finishes.
    done: watch::Sender<bool>,
}

/// An asynchronous connection to one Memcached server.
///
/// Create with [`new`](Self::new), spawn [`run`](Self::run), then issue
/// commands from any task. All commands are serialized FIFO onto the
/// single underlying TCP stream.
///
/// # Example
///
/// ```no_run
/// use metacache::{ConnectionConfig, MemcachedConnection};
///
/// # async fn example() -> metacache::Result<()> {
/// let connection = MemcachedConnection::new(ConnectionConfig::new("127.0.0.1", 11211));
/// let runner = {
///     let connection = connection.clone();
///     tokio::spawn(async move { connection.run().await })
/// };
///
/// connection.set("greeting", &String::from("hello")).await?;
/// let value: Option<String> = connection.get("greeting").await?;
/// assert_eq!(value.as_deref(), Some("hello"));
///
/// connection.close();
/// runner.await.expect("runner panicked")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedConnection {
    shared: Arc<Shared>,
}

impl MemcachedConnection {
    /// Create a handle in its initial state. Performs no I/O.
    pub fn new(config: ConnectionConfig) -> Self {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                request_tx,
                state: Mutex::new(StateSlot {
                    lifecycle: Lifecycle::Initial { config, requests },
                    on_close: Vec::new(),
                }),
                closing: AtomicBool::new(false),
                shutdown: Notify::new(),
                done,
            }),
        }
    }

    /// Connect and serve the request queue until the queue drains, the
    /// peer closes cleanly between requests, `close()` is called, or a
    /// fatal error occurs.
    ///
    /// Returns `Ok(())` on clean shutdown. Calling `run()` on a connection
    /// that is not in its initial state fails with `ConnectionShutdown`.
    pub async fn run(&self) -> Result<()> {
        let (config, requests) = self.take_initial()?;
        let mut guard = FinishGuard {
            shared: self.shared.clone(),
            requests: Some(requests),
        };
        let span = debug_span!(
            "memcached_connection",
            id = config.id,
            host = %config.host,
            port = config.port,
        );
        let result = self
            .drive(&config, guard.requests.as_mut().expect("receiver present"))
            .instrument(span)
            .await;
        drop(guard);
        result
    }

    /// Terminate the connection. Pending and future submissions fail with
    /// `ConnectionShutdown`. Idempotent.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();

        // a connection that never ran is finished right here; a running
        // one is finished by the driver when it observes the signal
        let initial = {
            let mut slot = self.shared.state.lock().expect("state mutex poisoned");
            if matches!(slot.lifecycle, Lifecycle::Initial { .. }) {
                match std::mem::replace(&mut slot.lifecycle, Lifecycle::Finished) {
                    Lifecycle::Initial { requests, .. } => {
                        Some((requests, std::mem::take(&mut slot.on_close)))
                    }
                    _ => unreachable!("lifecycle changed while locked"),
                }
            } else {
                None
            }
        };
        if let Some((mut requests, callbacks)) = initial {
            complete(&self.shared, &mut requests, callbacks);
        }
    }

    /// Wait until the connection has finished.
    pub async fn closed(&self) {
        let mut done = self.shared.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a callback invoked exactly once when the connection
    /// finishes. Invoked immediately if it already has.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let mut callback: Option<CloseCallback> = Some(Box::new(callback));
        {
            let mut slot = self.shared.state.lock().expect("state mutex poisoned");
            if !matches!(slot.lifecycle, Lifecycle::Finished) {
                slot.on_close.push(callback.take().expect("callback present"));
            }
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    // -- Typed commands ------------------------------------------------------

    /// Fetch the value of `key`. Returns `Ok(None)` on a miss.
    pub async fn get<V: MetaValue>(&self, key: impl AsRef<[u8]>) -> Result<Option<V>> {
        let key = validate_key(key.as_ref());
        let response = self
            .roundtrip(Request::get(key, MetaFlags::returning_value()))
            .await?;
        decode_value(response)
    }

    /// Fetch the value of `key` and reset its TTL in the same request.
    pub async fn get_and_touch<V: MetaValue>(
        &self,
        key: impl AsRef<[u8]>,
        ttl: TimeToLive,
    ) -> Result<Option<V>> {
        let key = validate_key(key.as_ref());
        let flags = MetaFlags {
            return_value: true,
            time_to_live: Some(ttl),
            ..Default::default()
        };
        let response = self.roundtrip(Request::get(key, flags)).await?;
        decode_value(response)
    }

    /// Fetch the value of `key` together with its remaining TTL.
    ///
    /// The TTL is computed from the seconds the server reports; an item
    /// that never expires (or a response without a `t` token) yields
    /// [`TimeToLive::Indefinitely`].
    pub async fn get_with_ttl<V: MetaValue>(
        &self,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<(V, TimeToLive)>> {
        let key = validate_key(key.as_ref());
        let flags = MetaFlags {
            return_value: true,
            return_ttl: true,
            ..Default::default()
        };
        let response = self.roundtrip(Request::get(key, flags)).await?;
        let ttl = match response.flags.and_then(|flags| flags.ttl_remaining) {
            Some(seconds) if seconds >= 0 => {
                TimeToLive::ExpiresAt(Instant::now() + Duration::from_secs(seconds as u64))
            }
            _ => TimeToLive::Indefinitely,
        };
        Ok(decode_value(response)?.map(|value| (value, ttl)))
    }

    /// Update the TTL of `key` without fetching its value.
    pub async fn touch(&self, key: impl AsRef<[u8]>, ttl: TimeToLive) -> Result<()> {
        let key = validate_key(key.as_ref());
        let flags = MetaFlags {
            time_to_live: Some(ttl),
            ..Default::default()
        };
        let response = self.roundtrip(Request::get(key, flags)).await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            ReturnCode::Miss | ReturnCode::NotFound => {
                Err(Error::key_not_found("touch failed: the key does not exist"))
            }
            code => Err(unexpected(code)),
        }
    }

    /// Store `value` under `key` with no expiration.
    pub async fn set<V: MetaValue>(&self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        self.set_with_ttl(key, value, TimeToLive::Indefinitely).await
    }

    /// Store `value` under `key` with the given TTL.
    pub async fn set_with_ttl<V: MetaValue>(
        &self,
        key: impl AsRef<[u8]>,
        value: &V,
        ttl: TimeToLive,
    ) -> Result<()> {
        let key = validate_key(key.as_ref());
        let flags = MetaFlags {
            time_to_live: Some(ttl),
            ..Default::default()
        };
        let response = self
            .roundtrip(Request::set(key, encode_value(value), Some(flags)))
            .await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            code => Err(unexpected(code)),
        }
    }

    /// Store `value` only if `key` does not exist yet.
    pub async fn add<V: MetaValue>(&self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        let response = self.store_with_mode(key.as_ref(), value, StorageMode::Add).await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            ReturnCode::NotStored => Err(Error::key_exist("add failed: the key already exists")),
            code => Err(unexpected(code)),
        }
    }

    /// Store `value` only if `key` already exists.
    pub async fn replace<V: MetaValue>(&self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        let response = self
            .store_with_mode(key.as_ref(), value, StorageMode::Replace)
            .await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            ReturnCode::NotStored => {
                Err(Error::key_not_found("replace failed: the key does not exist"))
            }
            code => Err(unexpected(code)),
        }
    }

    /// Append `value` to the value already stored under `key`.
    pub async fn append<V: MetaValue>(&self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        let response = self
            .store_with_mode(key.as_ref(), value, StorageMode::Append)
            .await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            code => Err(unexpected(code)),
        }
    }

    /// Prepend `value` to the value already stored under `key`.
    pub async fn prepend<V: MetaValue>(&self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        let response = self
            .store_with_mode(key.as_ref(), value, StorageMode::Prepend)
            .await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            code => Err(unexpected(code)),
        }
    }

    /// Delete `key`. Fails with `KeyNotFound` if it does not exist.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = validate_key(key.as_ref());
        let response = self.roundtrip(Request::delete(key)).await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            ReturnCode::NotFound => {
                Err(Error::key_not_found("delete failed: the key does not exist"))
            }
            code => Err(unexpected(code)),
        }
    }

    /// Increment the numeric value stored under `key` by `amount`.
    ///
    /// `amount` must be positive; zero is a programmer error.
    pub async fn increment(&self, key: impl AsRef<[u8]>, amount: u64) -> Result<()> {
        assert!(amount > 0, "increment amount must be positive");
        self.arithmetic(key.as_ref(), ArithmeticMode::Increment(amount))
            .await
    }

    /// Decrement the numeric value stored under `key` by `amount`.
    ///
    /// `amount` must be positive; zero is a programmer error.
    pub async fn decrement(&self, key: impl AsRef<[u8]>, amount: u64) -> Result<()> {
        assert!(amount > 0, "decrement amount must be positive");
        self.arithmetic(key.as_ref(), ArithmeticMode::Decrement(amount))
            .await
    }

    // -- Internals -----------------------------------------------------------

    async fn store_with_mode<V: MetaValue>(
        &self,
        key: &[u8],
        value: &V,
        mode: StorageMode,
    ) -> Result<Response> {
        let key = validate_key(key);
        let flags = MetaFlags {
            storage_mode: Some(mode),
            ..Default::default()
        };
        self.roundtrip(Request::set(key, encode_value(value), Some(flags)))
            .await
    }

    async fn arithmetic(&self, key: &[u8], mode: ArithmeticMode) -> Result<()> {
        let key = validate_key(key);
        let flags = MetaFlags {
            arithmetic_mode: Some(mode),
            ..Default::default()
        };
        let response = self.roundtrip(Request::arithmetic(key, flags)).await?;
        match response.return_code {
            ReturnCode::Success => Ok(()),
            ReturnCode::NotFound => {
                Err(Error::key_not_found("arithmetic failed: the key does not exist"))
            }
            code => Err(unexpected(code)),
        }
    }

    /// Enqueue a request and await its reply. The enqueue itself never
    /// blocks; the queue is unbounded.
    async fn roundtrip(&self, request: Request) -> Result<Response> {
        if self.is_shut_down() {
            return Err(Error::shutdown("connection has shut down"));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .request_tx
            .send((request, reply_tx))
            .map_err(|_| Error::shutdown("connection has shut down"))?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::shutdown("connection terminated before the reply arrived")),
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
            || matches!(
                self.shared.state.lock().expect("state mutex poisoned").lifecycle,
                Lifecycle::Finished
            )
    }

    fn take_initial(&self) -> Result<(ConnectionConfig, mpsc::UnboundedReceiver<RequestEntry>)> {
        let mut slot = self.shared.state.lock().expect("state mutex poisoned");
        match std::mem::replace(&mut slot.lifecycle, Lifecycle::Running) {
            Lifecycle::Initial { config, requests } => Ok((config, requests)),
            previous => {
                slot.lifecycle = previous;
                Err(Error::shutdown("run() requires a connection in its initial state"))
            }
        }
    }

    async fn drive(
        &self,
        config: &ConnectionConfig,
        requests: &mut mpsc::UnboundedReceiver<RequestEntry>,
    ) -> Result<()> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|cause| {
                Error::shutdown_with(
                    format!("failed to connect to {}:{}", config.host, config.port),
                    cause,
                )
            })?;
        debug!("connected");
        let (reader, writer) = stream.into_split();
        let mut driver = Driver {
            reader,
            writer,
            decoder: ResponseDecoder::new(),
            inbound: BytesMut::with_capacity(RECV_BUFFER_SIZE),
            scratch: MetaBuf::with_capacity(SEND_BUFFER_SIZE),
        };

        loop {
            if self.shared.closing.load(Ordering::SeqCst) {
                debug!("close requested");
                return Ok(());
            }
            // the futures in this select must not borrow `driver` pieces the
            // request handler needs, so the handler bodies only classify
            let event = tokio::select! {
                _ = self.shared.shutdown.notified() => Event::Closed,
                entry = requests.recv() => match entry {
                    Some(entry) => Event::Request(entry),
                    None => Event::Drained,
                },
                read = driver.reader.read_buf(&mut driver.inbound) => Event::IdleRead(read),
            };
            match event {
                Event::Closed => {
                    debug!("close requested");
                    return Ok(());
                }
                Event::Drained => {
                    debug!("request stream drained");
                    return Ok(());
                }
                Event::Request((request, reply)) => {
                    if matches!(
                        driver.serve(&self.shared.shutdown, request, reply).await?,
                        Served::Closed
                    ) {
                        debug!("close requested");
                        return Ok(());
                    }
                }
                Event::IdleRead(Ok(0)) => {
                    driver.decoder.decode_eof(&driver.inbound).map_err(|cause| {
                        Error::shutdown_with("server closed the connection mid-stream", cause)
                    })?;
                    debug!("server closed the connection");
                    return Ok(());
                }
                Event::IdleRead(Ok(_)) => {
                    return Err(Error::protocol("received bytes with no request in flight"));
                }
                Event::IdleRead(Err(cause)) => {
                    return Err(Error::shutdown_with("socket read failed", cause));
                }
            }
        }
    }
}

/// One turn of the driver loop.
enum Event {
    Request(RequestEntry),
    Drained,
    Closed,
    IdleRead(std::io::Result<usize>),
}

/// Outcome of serving one request.
enum Served {
    /// Response delivered to the caller.
    Response,
    /// `close()` observed while the response was outstanding.
    Closed,
}

struct Driver {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: ResponseDecoder,
    inbound: BytesMut,
    scratch: MetaBuf,
}

impl Driver {
    async fn serve(&mut self, shutdown: &Notify, request: Request, reply: ReplySlot) -> Result<Served> {
        self.scratch.clear();
        request.encode(&mut self.scratch);
        trace!(len = self.scratch.remaining(), "writing request");
        if let Err(cause) = self.writer.write_all(self.scratch.readable()).await {
            return Err(fail_both(
                reply,
                Error::shutdown_with("socket write failed", cause),
            ));
        }
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = reply.send(Err(Error::shutdown(
                    "connection closed while a response was outstanding",
                )));
                Ok(Served::Closed)
            }
            response = read_one(&mut self.reader, &mut self.decoder, &mut self.inbound) => {
                match response {
                    Ok(response) => {
                        trace!(code = %response.return_code, "response decoded");
                        // a cancelled caller leaves a detached slot; the
                        // response is still consumed to keep the stream in sync
                        let _ = reply.send(Ok(response));
                        Ok(Served::Response)
                    }
                    Err(error) => Err(fail_both(reply, error)),
                }
            }
        }
    }
}

/// Read until the decoder yields exactly one response.
async fn read_one(
    reader: &mut OwnedReadHalf,
    decoder: &mut ResponseDecoder,
    inbound: &mut BytesMut,
) -> Result<Response> {
    loop {
        if let Some(response) = decoder
            .decode(inbound)
            .map_err(|cause| Error::protocol_with("malformed response from server", cause))?
        {
            return Ok(response);
        }
        let read = reader
            .read_buf(inbound)
            .await
            .map_err(|cause| Error::shutdown_with("socket read failed", cause))?;
        if read == 0 {
            return Err(Error::shutdown(
                "server closed the connection while a response was outstanding",
            ));
        }
    }
}

/// Resume the in-flight caller with `error` and hand `run()` a twin of the
/// same kind and message. The caller's copy keeps the underlying cause.
fn fail_both(reply: ReplySlot, error: Error) -> Error {
    let twin = Error::new(error.kind(), error.message().to_owned());
    let _ = reply.send(Err(error));
    twin
}

/// Finishes the connection when `run()` exits or is cancelled.
struct FinishGuard {
    shared: Arc<Shared>,
    requests: Option<mpsc::UnboundedReceiver<RequestEntry>>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(mut requests) = self.requests.take() {
            finish(&self.shared, &mut requests);
        }
    }
}

fn finish(shared: &Shared, requests: &mut mpsc::UnboundedReceiver<RequestEntry>) {
    let callbacks = {
        let mut slot = shared.state.lock().expect("state mutex poisoned");
        if matches!(slot.lifecycle, Lifecycle::Finished) {
            return;
        }
        slot.lifecycle = Lifecycle::Finished;
        std::mem::take(&mut slot.on_close)
    };
    complete(shared, requests, callbacks);
}

/// Close the queue, fail everything still in it, and notify observers.
fn complete(
    shared: &Shared,
    requests: &mut mpsc::UnboundedReceiver<RequestEntry>,
    callbacks: Vec<CloseCallback>,
) {
    requests.close();
    while let Ok((_, reply)) = requests.try_recv() {
        let _ = reply.send(Err(Error::shutdown("connection has shut down")));
    }
    shared.done.send_replace(true);
    for callback in callbacks {
        callback();
    }
}

fn unexpected(code: ReturnCode) -> Error {
    Error::protocol(format!("unexpected return code {code}"))
}

fn encode_value<V: MetaValue>(value: &V) -> Bytes {
    let mut buf = MetaBuf::with_capacity(64);
    value.write_to(&mut buf);
    buf.into_bytes()
}

fn decode_value<V: MetaValue>(response: Response) -> Result<Option<V>> {
    match response.return_code {
        ReturnCode::Value => {
            let data = response
                .value
                .ok_or_else(|| Error::protocol("value missing on VA response"))?;
            let was_empty = data.is_empty();
            let mut buf = MetaBuf::from_slice(&data);
            match V::read_from(&mut buf) {
                Some(value) => Ok(Some(value)),
                None if was_empty => Ok(None),
                None => Err(Error::protocol("could not decode value payload")),
            }
        }
        ReturnCode::Miss => Ok(None),
        code => Err(unexpected(code)),
    }
}

/// Keys must be non-empty printable ASCII with no whitespace; the protocol
/// cannot frame anything else. Violations are programmer errors.
fn validate_key(key: &[u8]) -> Bytes {
    assert!(!key.is_empty(), "memcached keys must not be empty");
    assert!(
        key.iter()
            .all(|byte| byte.is_ascii() && !byte.is_ascii_whitespace() && !byte.is_ascii_control()),
        "memcached keys must be printable ASCII without whitespace"
    );
    Bytes::copy_from_slice(key)
}
