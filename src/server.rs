use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Event, Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::{Receiver, SendError, Sender};

use crate::proto::Receive;

type Result<T> = std::io::Result<T>;

pub struct Server;

pub struct ServerIncoming {
    incoming_poll: Poll,
    incoming_rx: Receiver<InternalIncomingEvent>,
    server_tx: Arc<Mutex<Sender<InternalCommand>>>,
}

/// Handle to one accepted connection. Responses may be queued from any
/// thread; the server thread drains them. Connections are persistent and
/// carry any number of request/response exchanges.
#[derive(Clone)]
pub struct Client {
    internal: Arc<Mutex<InternalClient>>,
}

pub enum IncomingResult<T> {
    Request(Client, T),
    Shutdown,
}

struct ServerThread {
    clients: HashMap<Token, Arc<Mutex<InternalClient>>>,
    server_tx: Weak<Mutex<Sender<InternalCommand>>>,
    server_rx: Receiver<InternalCommand>,
    incoming_tx: Sender<InternalIncomingEvent>,
    poll: Poll,
    tokens: Vec<Token>,
    listeners: HashMap<Token, InternalListener>,
    rx_token: Token,
}

#[derive(Debug)]
struct InternalListener {
    token: Token,
    listener: TcpListener,
}

struct InternalClient {
    token: Option<Token>,
    stream: TcpStream,
    in_buffer: BytesMut,
    out_buffer: BytesMut,
    server_tx: Arc<Mutex<Sender<InternalCommand>>>,
}

enum InternalCommand {
    AddListener(TcpListener),
    Close(Arc<Mutex<InternalClient>>),
    Respond(Arc<Mutex<InternalClient>>, BytesMut),
    Shutdown,
}

enum InternalIncomingEvent {
    Receive(Arc<Mutex<InternalClient>>),
}

enum InternalResult {
    Ok,
    Unhandled,
    Disconnected,
}

impl Server {
    pub fn launch_new() -> Result<ServerIncoming> {
        let rx_token = Token(0);

        let (server_tx, server_rx) = mio_extras::channel::channel::<InternalCommand>();

        let (incoming_tx, incoming_rx) = mio_extras::channel::channel::<InternalIncomingEvent>();
        let incoming_poll = Poll::new()?;
        incoming_poll.register(&incoming_rx, rx_token, Ready::readable(), PollOpt::edge())?;

        let server_tx = Arc::new(Mutex::new(server_tx));

        let result = ServerIncoming {
            incoming_poll,
            incoming_rx,
            server_tx: server_tx.clone(),
        };

        let mut thread = ServerThread {
            clients: HashMap::new(),
            server_tx: Arc::downgrade(&server_tx),
            server_rx,
            incoming_tx,
            poll: Poll::new()?,
            tokens: (1..1024).map(Token).collect(),
            listeners: HashMap::new(),
            rx_token: Token(0),
        };

        let _join_handle = std::thread::spawn(move || {
            if let Err(e) = thread.run() {
                error!("thread finished with error: {}", e);
            }
        });

        Ok(result)
    }
}

impl ServerIncoming {
    pub fn add_listener(&self, listener: TcpListener) -> Result<()> {
        self.server_tx
            .lock()
            .unwrap()
            .send(InternalCommand::AddListener(listener))
            .map_err(send_error)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self
            .server_tx
            .lock()
            .unwrap()
            .send(InternalCommand::Shutdown);
    }

    /// Blocks until a client has buffered at least one complete message.
    /// The process function consumes complete frames from the buffer;
    /// Invalid framing closes the offending connection.
    pub fn receive_next_fn<F, T>(&self, process: F) -> Result<IncomingResult<T>>
    where
        F: Fn(&mut BytesMut) -> Receive<T>,
    {
        let mut events = Events::with_capacity(32);
        loop {
            self.incoming_poll.reregister(
                &self.incoming_rx,
                Token(0),
                Ready::readable(),
                PollOpt::edge(),
            )?;
            self.incoming_poll.poll(&mut events, None)?;

            let event = match self.incoming_rx.try_recv() {
                Ok(ev) => ev,
                Err(err) => match err {
                    TryRecvError::Empty => {
                        continue;
                    }
                    TryRecvError::Disconnected => {
                        return Ok(IncomingResult::Shutdown);
                    }
                },
            };

            match event {
                InternalIncomingEvent::Receive(internal_client) => {
                    let received = {
                        let mut client = internal_client.lock().unwrap();

                        if client.token.is_none() {
                            continue;
                        }

                        process(&mut client.in_buffer)
                    };

                    match received {
                        Receive::Receive(v) => {
                            return Ok(IncomingResult::Request(
                                Client {
                                    internal: internal_client.clone(),
                                },
                                v,
                            ));
                        }
                        Receive::Invalid => {
                            if let Err(err) = self
                                .server_tx
                                .lock()
                                .unwrap()
                                .send(InternalCommand::Close(internal_client.clone()))
                            {
                                return match err {
                                    SendError::Io(err) => Err(err),
                                    SendError::Disconnected(_) => Ok(IncomingResult::Shutdown),
                                };
                            }
                        }
                        Receive::None => {}
                    }
                }
            }
        }
    }
}

impl Client {
    /// Queues a response frame on the connection.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let internal = self.internal.lock().unwrap();

        if internal.token.is_some() {
            if let Err(SendError::Io(err)) = internal
                .server_tx
                .lock()
                .unwrap()
                .send(InternalCommand::Respond(
                    self.internal.clone(),
                    BytesMut::from(data),
                ))
            {
                return Err(err);
            }
        }

        Ok(())
    }
}

fn send_error<T>(err: SendError<T>) -> std::io::Error {
    match err {
        SendError::Io(err) => err,
        SendError::Disconnected(_) => {
            std::io::Error::new(std::io::ErrorKind::Other, "server thread gone")
        }
    }
}

impl ServerThread {
    fn run(&mut self) -> Result<()> {
        debug!("started");

        self.poll.register(
            &self.server_rx,
            self.rx_token,
            Ready::readable(),
            PollOpt::edge(),
        )?;

        let mut events = Events::with_capacity(1024);

        'main: loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                let event_token = event.token();

                if event_token == self.rx_token {
                    loop {
                        match self.process_server_rx()? {
                            InternalResult::Ok => {}
                            InternalResult::Unhandled => break,
                            InternalResult::Disconnected => break 'main,
                        }
                    }
                    continue;
                }

                match self.try_process_listener(&event)? {
                    InternalResult::Ok => continue,
                    InternalResult::Unhandled => {}
                    InternalResult::Disconnected => {
                        break 'main;
                    }
                }

                match self.try_process_client(&event)? {
                    InternalResult::Ok => {}
                    InternalResult::Unhandled => {
                        error!("token without matching client from poll");
                        continue;
                    }
                    InternalResult::Disconnected => {
                        break 'main;
                    }
                }
            }
        }

        debug!("stopping");

        Ok(())
    }

    fn close_client(&mut self, client: &mut InternalClient) -> Result<()> {
        if let Some(token) = client.token.take() {
            self.poll.deregister(&client.stream)?;
            self.clients.remove(&token);
            self.tokens.push(token);
        }

        Ok(())
    }

    fn reregister_client(&self, client: &InternalClient) -> Result<()> {
        let token = match client.token {
            Some(t) => t,
            None => return Ok(()),
        };

        let mut interest = Ready::readable();
        if !client.out_buffer.is_empty() {
            interest |= Ready::writable();
        }

        self.poll
            .reregister(&client.stream, token, interest, PollOpt::edge())?;

        Ok(())
    }

    fn process_server_rx(&mut self) -> Result<InternalResult> {
        let command = match self.server_rx.try_recv() {
            Ok(c) => c,
            Err(err) => {
                return Ok(match err {
                    TryRecvError::Empty => InternalResult::Unhandled,
                    TryRecvError::Disconnected => InternalResult::Disconnected,
                });
            }
        };

        self.poll.reregister(
            &self.server_rx,
            self.rx_token,
            Ready::readable(),
            PollOpt::edge(),
        )?;

        match command {
            InternalCommand::AddListener(listener) => match self.tokens.pop() {
                Some(token) => {
                    self.poll
                        .register(&listener, token, Ready::readable(), PollOpt::edge())?;
                    self.listeners
                        .insert(token, InternalListener { token, listener });
                }
                None => {
                    error!("max connections reached");
                }
            },
            InternalCommand::Close(client) => {
                let mut client = client.lock().unwrap();
                self.close_client(&mut client)?;
            }
            InternalCommand::Respond(client, data) => {
                let mut client = client.lock().unwrap();

                if client.token.is_some() {
                    client.out_buffer.extend_from_slice(&data);
                    self.reregister_client(&client)?;
                }
            }
            InternalCommand::Shutdown => {
                return Ok(InternalResult::Disconnected);
            }
        }

        Ok(InternalResult::Ok)
    }

    fn try_process_listener(&mut self, event: &Event) -> Result<InternalResult> {
        let event_token = event.token();

        if let Some(listener) = self.listeners.get_mut(&event_token) {
            loop {
                let (stream, address) = match listener.listener.accept() {
                    Ok(c) => c,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("tcp accept error: {}", e);
                        break;
                    }
                };

                let token = match self.tokens.pop() {
                    Some(t) => t,
                    None => {
                        error!("max connections reached");
                        break;
                    }
                };

                self.poll
                    .register(&stream, token, Ready::readable(), PollOpt::edge())?;

                trace!("accepted client from {}", address);

                let server_tx = match self.server_tx.upgrade() {
                    Some(tx) => tx,
                    None => {
                        return Ok(InternalResult::Disconnected);
                    }
                };

                self.clients.insert(
                    token,
                    Arc::new(Mutex::new(InternalClient {
                        token: Some(token),
                        stream,
                        in_buffer: BytesMut::new(),
                        out_buffer: BytesMut::new(),
                        server_tx,
                    })),
                );
            }

            self.poll.reregister(
                &listener.listener,
                listener.token,
                Ready::readable(),
                PollOpt::edge(),
            )?;

            Ok(InternalResult::Ok)
        } else {
            Ok(InternalResult::Unhandled)
        }
    }

    fn try_process_client(&mut self, event: &Event) -> Result<InternalResult> {
        let event_token = event.token();

        let mutex_client = match self.clients.get(&event_token) {
            Some(c) => c.clone(),
            None => {
                return Ok(InternalResult::Unhandled);
            }
        };

        let temp_client = mutex_client.clone();
        let mut client = temp_client.lock().unwrap();

        if event.readiness().is_readable() {
            let mut buf = [0; 4096];
            let mut received = false;

            loop {
                match client.stream.read(&mut buf) {
                    Ok(0) => {
                        trace!("client closed connection");
                        self.close_client(&mut client)?;
                        return Ok(InternalResult::Ok);
                    }
                    Ok(n) => {
                        client.in_buffer.extend_from_slice(&buf[0..n]);
                        received = true;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("tcp read error: {}", e);
                        self.close_client(&mut client)?;
                        return Ok(InternalResult::Ok);
                    }
                }
            }

            if received {
                if let Err(SendError::Disconnected(_)) = self
                    .incoming_tx
                    .send(InternalIncomingEvent::Receive(mutex_client.clone()))
                {
                    return Ok(InternalResult::Disconnected);
                }
            }
        }

        if event.readiness().is_writable() && !client.out_buffer.is_empty() {
            loop {
                if client.out_buffer.is_empty() {
                    break;
                }

                let buf = client.out_buffer.clone();
                match client.stream.write(&buf) {
                    Ok(n) => {
                        client.out_buffer.advance(n);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("tcp write error: {}", e);
                        self.close_client(&mut client)?;
                        return Ok(InternalResult::Ok);
                    }
                }
            }
        }

        self.reregister_client(&client)?;

        Ok(InternalResult::Ok)
    }
}
