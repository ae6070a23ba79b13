use super::{
    wire::{read_frame, write_frame},
    CallId, Outcome, Reply, Request, Response, RpcError,
};
use crate::{ledger::InitStep, membership::WorkerId, promise::Promise, task::Task};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    io::BufReader,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, info, trace, warn};

type PendingMap = BTreeMap<CallId, Promise<Result<Outcome, RpcError>>>;

/// Request/response channel to a joined worker over its authenticated TCP stream.
///
/// Requests are written by the calling thread, replies are routed to their `Reply` by a
/// dedicated reader thread. When the stream closes every outstanding reply resolves to
/// `RpcError::Disconnected`.
#[derive(Debug)]
pub struct RemoteEndpoint {
    worker: WorkerId,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    pending: Arc<Mutex<PendingMap>>,
    alive: Arc<AtomicBool>,
    next_call: AtomicU64,
}

impl RemoteEndpoint {
    /// Take over `stream` and start the reply reader.
    /// `on_close` runs once on the reader thread after the connection is gone.
    pub fn start<F>(worker: WorkerId, stream: TcpStream, on_close: F) -> Result<Arc<Self>, RpcError>
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        let peer = stream.peer_addr()?;
        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        let control = stream.try_clone()?;

        let endpoint = Arc::new(Self {
            worker,
            peer,
            writer: Mutex::new(stream),
            control,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
            next_call: AtomicU64::new(1),
        });

        let pending = endpoint.pending.clone();
        let alive = endpoint.alive.clone();

        thread::Builder::new()
            .name(format!("flock-reader-{worker}"))
            .spawn(move || {
                read_replies(worker, reader, &pending);

                {
                    let mut pending = pending.lock();
                    alive.store(false, Ordering::SeqCst);

                    for (_, promise) in std::mem::take(&mut *pending) {
                        promise.fulfil(Err(RpcError::Disconnected(worker)));
                    }
                }

                on_close(worker);
            })?;

        Ok(endpoint)
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn call(&self, task: Task) -> Result<Reply, RpcError> {
        self.send(|id| Request::Call { id, task })
    }

    pub fn initialize(&self, steps: Vec<InitStep>) -> Result<Reply, RpcError> {
        self.send(|id| Request::Initialize { id, steps })
    }

    fn send<F>(&self, build: F) -> Result<Reply, RpcError>
    where
        F: FnOnce(CallId) -> Request,
    {
        let id = self.next_call.fetch_add(1, Ordering::SeqCst);
        let reply = Reply::pending(self.worker);

        // registering under the pending lock orders us against the reader's final drain
        {
            let mut pending = self.pending.lock();

            if !self.is_alive() {
                return Err(RpcError::Disconnected(self.worker));
            }

            pending.insert(id, reply.promise().clone());
        }

        let request = build(id);
        let written = write_frame(&mut *self.writer.lock(), &request);

        if let Err(error) = written {
            self.pending.lock().remove(&id);
            warn!(worker = %self.worker, error = ?error, "Failed to send request, closing connection");
            self.close();

            return Err(if error.is_disconnect() {
                RpcError::Disconnected(self.worker)
            } else {
                error
            });
        }

        trace!(worker = %self.worker, call = id, "Request sent");

        Ok(reply)
    }

    /// Ask the worker to exit and close the connection.
    /// Outstanding replies resolve to `Disconnected` once the reader notices.
    pub fn shutdown(&self) {
        if self.is_alive() {
            if let Some(mut writer) = self.writer.try_lock() {
                if let Err(error) = write_frame(&mut *writer, &Request::Shutdown) {
                    debug!(worker = %self.worker, error = ?error, "Failed to deliver shutdown request");
                }
            }
        }

        self.close();
    }

    fn close(&self) {
        if let Err(error) = self.control.shutdown(Shutdown::Both) {
            trace!(worker = %self.worker, error = ?error, "Connection already closed");
        }
    }
}

fn read_replies(worker: WorkerId, mut reader: BufReader<TcpStream>, pending: &Mutex<PendingMap>) {
    loop {
        match read_frame::<_, Response>(&mut reader) {
            Ok(response) => match pending.lock().remove(&response.id) {
                Some(promise) => {
                    promise.fulfil(Ok(response.result));
                }
                None => {
                    debug!(worker = %worker, call = response.id, "Dropping reply nobody waits for");
                }
            },
            Err(error) if error.is_disconnect() => {
                info!(worker = %worker, "Connection to worker closed");
                break;
            }
            Err(error) => {
                warn!(worker = %worker, error = ?error, "Failed to read from worker, closing connection");
                let _ = reader.get_ref().shutdown(Shutdown::Both);
                break;
            }
        }
    }
}
