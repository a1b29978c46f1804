use crate::{
    error::CallError,
    message::{Request, Response},
    transport::{lock, Channel, RequestHandler, Transport},
};
use bytes::{Buf, BufMut, BytesMut};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};
use tracing::{debug, trace, warn};

const HEADER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a call waits for its reply before giving up. Longer than the
/// default reply window, so a call is only abandoned once nobody collects it.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

// Every frame on the wire is a big-endian u32 length followed by a bincode
// body. Calls and replies carry an id so that replies can arrive out of order.
#[derive(Serialize, Deserialize)]
struct CallFrame {
    id: u64,
    request: Request,
}

#[derive(Serialize, Deserialize)]
struct ReplyFrame {
    id: u64,
    result: Result<Response, String>,
}

fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), CallError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CallError::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, CallError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = (&header[..]).get_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(CallError::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

type Waiter = Sender<Result<Response, CallError>>;

// None once the connection is gone, so that late callers fail right away.
type Pending = Arc<Mutex<Option<HashMap<u64, Waiter>>>>;

/// TcpChannel multiplexes concurrent calls over one TCP connection. A reader
/// thread hands every reply to the call waiting on the same id; a call that
/// hears nothing for `call_timeout` fails with `CallError::Timeout`.
pub struct TcpChannel {
    writer: Mutex<TcpStream>,
    pending: Pending,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl TcpChannel {
    pub fn connect(
        address: &str,
        port: u16,
        call_timeout: Duration,
    ) -> Result<TcpChannel, io::Error> {
        let stream = TcpStream::connect((address, port))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_pending = pending.clone();
        thread::spawn(move || read_replies(reader, reader_pending));

        Ok(TcpChannel {
            writer: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(0),
            call_timeout,
        })
    }

    fn forget(&self, id: u64) {
        if let Some(waiters) = lock(&self.pending).as_mut() {
            waiters.remove(&id);
        }
    }
}

impl Channel for TcpChannel {
    fn call(&self, request: Request) -> Result<Response, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        match lock(&self.pending).as_mut() {
            Some(waiters) => {
                waiters.insert(id, tx);
            }
            None => return Err(CallError::Disconnected),
        }

        let sent = write_frame(&mut *lock(&self.writer), &CallFrame { id, request });
        if let Err(err) = sent {
            self.forget(id);
            return Err(err);
        }

        match rx.recv_timeout(self.call_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.forget(id);
                trace!(id, "call timed out");
                Err(CallError::Timeout(self.call_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CallError::Disconnected),
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        // Unblocks the reader thread.
        let stream = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn read_replies(mut stream: TcpStream, pending: Pending) {
    loop {
        match read_frame::<_, ReplyFrame>(&mut stream) {
            Ok(reply) => {
                let waiter = lock(&pending)
                    .as_mut()
                    .and_then(|waiters| waiters.remove(&reply.id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply.result.map_err(CallError::Remote));
                    }
                    None => trace!(id = reply.id, "reply for unknown call"),
                }
            }
            Err(err) => {
                debug!(%err, "peer connection closed");
                break;
            }
        }
    }

    if let Some(waiters) = lock(&pending).take() {
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(CallError::Disconnected));
        }
    }
}

/// TcpTransport carries requests over plain TCP connections.
#[derive(Clone, Copy, Debug)]
pub struct TcpTransport {
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(call_timeout: Duration) -> TcpTransport {
        TcpTransport { call_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl Transport for TcpTransport {
    fn dial(&self, address: &str, port: u16) -> Result<Arc<dyn Channel>, io::Error> {
        Ok(Arc::new(TcpChannel::connect(address, port, self.call_timeout)?))
    }

    fn listen(
        &self,
        address: &str,
        port: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<SocketAddr, io::Error> {
        let listener = TcpListener::bind((address, port))?;
        let local_addr = listener.local_addr()?;
        thread::spawn(move || accept_connections(listener, handler));
        Ok(local_addr)
    }
}

// Runs for the lifetime of the process. A failed accept never stops the
// listener, it only pauses it for ACCEPT_BACKOFF.
fn accept_connections(listener: TcpListener, handler: Arc<dyn RequestHandler>) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let handler = handler.clone();
                thread::spawn(move || serve_connection(stream, remote, handler));
            }
            Err(err) => {
                warn!(%err, "could not accept peer connection");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

fn serve_connection(stream: TcpStream, remote: SocketAddr, handler: Arc<dyn RequestHandler>) {
    debug!(%remote, "accepted peer connection");
    let writer = match stream.try_clone() {
        Ok(writer) => Arc::new(Mutex::new(writer)),
        Err(err) => {
            warn!(%remote, %err, "could not set up peer connection");
            return;
        }
    };

    let mut reader = stream;
    loop {
        let call: CallFrame = match read_frame(&mut reader) {
            Ok(call) => call,
            Err(err) => {
                debug!(%remote, %err, "peer connection closed");
                return;
            }
        };

        let handler = handler.clone();
        let writer = writer.clone();
        thread::spawn(move || {
            let kind = call.request.kind();
            let reply = ReplyFrame {
                id: call.id,
                result: handler.handle(call.request),
            };
            if let Err(err) = write_frame(&mut *lock(&writer), &reply) {
                debug!(%remote, %err, kind, "could not send reply");
            }
        });
    }
}
