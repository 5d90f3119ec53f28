use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;

use crate::collection::{Collection, Target};
use crate::error::{Error, Result};
use crate::proto::{
    self, ConfigInfo, Entry, MediaHandle, Op, Receive, Request, Response, ResponseBody, Source,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a single metadata field request. `Absent` is a normal result,
/// not an error; `Unreachable` means the node went away before answering.
#[derive(Debug, Clone, PartialEq)]
pub enum FactReply {
    Value(String),
    Absent,
    Unreachable,
}

#[derive(Debug)]
pub enum RpcReply {
    Response(ResponseBody),
    Unreachable,
}

type PendingCallback = Box<dyn FnOnce(RpcReply) + Send>;

/// One live connection to a peer node. Requests are correlated by id; every
/// issued request fires its callback exactly once, with `Unreachable` if
/// the transport goes away first.
#[derive(Clone)]
pub struct NodeLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    stream: Mutex<TcpStream>,
    // None once the link is closed; no callback survives in here
    pending: Mutex<Option<HashMap<u64, PendingCallback>>>,
    next_request_id: AtomicU64,
}

impl NodeLink {
    pub fn connect<F>(address: &SocketAddr, on_close: F) -> Result<NodeLink>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = TcpStream::connect_timeout(address, CONNECT_TIMEOUT)?;
        let read_stream = stream.try_clone()?;

        let link = NodeLink {
            inner: Arc::new(LinkInner {
                stream: Mutex::new(stream),
                pending: Mutex::new(Some(HashMap::new())),
                next_request_id: AtomicU64::new(0),
            }),
        };

        let inner = link.inner.clone();

        std::thread::spawn(move || {
            read_loop(&inner, read_stream);
            close_link(&inner);
            on_close();
        });

        Ok(link)
    }

    /// Shuts the transport down; the reader thread drains every pending
    /// callback with `Unreachable`.
    pub fn close(&self) {
        let _ = self.inner.stream.lock().unwrap().shutdown(Shutdown::Both);
    }

    /// Issues one operation. The callback fires exactly once, from the
    /// reader thread on response or teardown, or inline when the link is
    /// already unusable.
    pub fn request(&self, op: Op, callback: PendingCallback) {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut callback = Some(callback);

        {
            let mut pending = self.inner.pending.lock().unwrap();

            if let Some(map) = pending.as_mut() {
                map.insert(request_id, callback.take().unwrap());
            }
        }

        if let Some(callback) = callback {
            callback(RpcReply::Unreachable);
            return;
        }

        trace!("request {} {:?}", request_id, op);

        let frame = match proto::encode_frame(&Request { request_id, op }) {
            Ok(f) => f,
            Err(e) => {
                error!("can't encode request: {}", e);
                self.fail_request(request_id);
                return;
            }
        };

        let write_result = self.inner.stream.lock().unwrap().write_all(&frame);

        if let Err(e) = write_result {
            error!("write error: {}", e);
            self.fail_request(request_id);
            self.close();
        }
    }

    // Fires a still-pending callback with Unreachable. The reader thread
    // may have raced us; whoever removes the entry invokes it.
    fn fail_request(&self, request_id: u64) {
        let callback = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.as_mut().and_then(|map| map.remove(&request_id))
        };

        if let Some(callback) = callback {
            callback(RpcReply::Unreachable);
        }
    }

    /// Single-field metadata request, the primitive of the async query
    /// protocol. Fallback chains are composed by the caller.
    pub fn request_fact<F>(&self, file_id: i64, fact_name: &str, callback: F)
    where
        F: FnOnce(FactReply) + Send + 'static,
    {
        let op = Op::GetFact {
            file_id,
            fact_name: fact_name.to_string(),
        };

        self.request(
            op,
            Box::new(move |reply| {
                callback(match reply {
                    RpcReply::Response(ResponseBody::Fact { value: Some(value) }) => {
                        FactReply::Value(value)
                    }
                    RpcReply::Response(ResponseBody::Fact { value: None }) => FactReply::Absent,
                    RpcReply::Response(ResponseBody::Error { message }) => {
                        error!("fact request failed: {}", message);
                        FactReply::Absent
                    }
                    RpcReply::Response(other) => {
                        error!("unexpected response {:?}", other);
                        FactReply::Absent
                    }
                    RpcReply::Unreachable => FactReply::Unreachable,
                });
            }),
        );
    }

    fn call(&self, op: Op) -> Result<ResponseBody> {
        let (tx, rx) = mpsc::channel();

        self.request(
            op,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );

        match rx.recv() {
            Ok(RpcReply::Response(ResponseBody::Error { message })) => {
                Err(Error::ProtocolError(message))
            }
            Ok(RpcReply::Response(body)) => Ok(body),
            Ok(RpcReply::Unreachable) | Err(_) => Err(Error::Unreachable),
        }
    }

    pub fn get_sources(&self) -> Result<Vec<Source>> {
        match self.call(Op::GetSources)? {
            ResponseBody::Sources { sources } => Ok(sources),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get_directory(&self, path: &str) -> Result<Vec<Entry>> {
        match self.call(Op::GetDirectory {
            path: path.to_string(),
        })? {
            ResponseBody::Directory { entries } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get_collection(&self, collection: &Collection) -> Result<Vec<MediaHandle>> {
        match self.call(Op::GetCollection {
            kind: collection.kind,
            category: collection.category.clone(),
            pattern: collection.pattern.clone(),
        })? {
            ResponseBody::Collection { items } => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get_config(&self) -> Result<ConfigInfo> {
        match self.call(Op::GetConfig)? {
            ResponseBody::Config { config } => Ok(config),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(body: &ResponseBody) -> Error {
    Error::ProtocolError(format!("unexpected response {:?}", body))
}

/// Issues a fact request against a local store or a connected node; the
/// callback contract is identical in both cases.
pub fn request_fact<F>(target: &Target, file_id: i64, fact_name: &str, callback: F)
where
    F: FnOnce(FactReply) + Send + 'static,
{
    match target {
        Target::Local(store) => {
            let reply = match store.get_fact(file_id, fact_name) {
                Ok(Some(value)) => FactReply::Value(value),
                Ok(None) => FactReply::Absent,
                Err(e) => {
                    error!("local fact lookup failed: {}", e);
                    FactReply::Absent
                }
            };

            callback(reply);
        }
        Target::Remote(link) => link.request_fact(file_id, fact_name, callback),
    }
}

fn read_loop(inner: &Arc<LinkInner>, mut stream: TcpStream) {
    let mut buffer = BytesMut::new();
    let mut read_buf = [0; 4096];
    let mut invalid_frames = 0;

    'main: loop {
        let n = match stream.read(&mut read_buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("read error: {}", e);
                break;
            }
        };

        buffer.extend_from_slice(&read_buf[0..n]);

        loop {
            let before = buffer.len();

            match proto::read_frame::<Response>(&mut buffer) {
                Receive::Receive(response) => {
                    invalid_frames = 0;
                    dispatch_response(inner, response);
                }
                Receive::Invalid => {
                    invalid_frames += 1;

                    // framing lost or repeated garbage, give up on the link
                    if buffer.len() == before || invalid_frames >= 3 {
                        error!("closing link after repeated protocol errors");
                        break 'main;
                    }
                }
                Receive::None => break,
            }
        }
    }
}

fn dispatch_response(inner: &Arc<LinkInner>, response: Response) {
    trace!("response {}", response.request_id);

    let callback = {
        let mut pending = inner.pending.lock().unwrap();
        pending
            .as_mut()
            .and_then(|map| map.remove(&response.request_id))
    };

    match callback {
        Some(callback) => callback(RpcReply::Response(response.body)),
        None => {
            debug!("response {} without pending request", response.request_id);
        }
    }
}

// Takes the pending table out and fires every callback with Unreachable;
// after this no request can be added to the table.
fn close_link(inner: &Arc<LinkInner>) {
    let _ = inner.stream.lock().unwrap().shutdown(Shutdown::Both);

    let pending = inner.pending.lock().unwrap().take();

    if let Some(map) = pending {
        let count = map.len();

        for (_, callback) in map {
            callback(RpcReply::Unreachable);
        }

        if count > 0 {
            debug!("drained {} pending requests", count);
        }
    }
}
