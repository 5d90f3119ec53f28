use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nodes::{NodeDirectory, NodeInfo, NodeKey};

pub const SERVICE_TYPE: &str = "_mediad._tcp";
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const EXPIRE_AFTER: Duration = Duration::from_secs(15);
const POLL_STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DiscoveryMessage {
    Announce {
        service: String,
        token: u64,
        name: String,
        port: u16,
    },
    Goodbye {
        service: String,
        token: u64,
        name: String,
    },
}

fn instance_token() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);

    (u64::from(std::process::id()) << 32) ^ nanos
}

/// Multicast announcement and browsing. Announces this node's service
/// periodically and feeds peer announcements into the node directory.
pub struct Discovery {
    stop: Arc<AtomicBool>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    pub fn launch(
        directory: NodeDirectory,
        name: Arc<Mutex<String>>,
        rpc_port: u16,
        discovery_port: u16,
    ) -> Result<Discovery> {
        let stop = Arc::new(AtomicBool::new(false));
        let announce_now = Arc::new(AtomicBool::new(false));
        let token = instance_token();

        let browse_socket = open_browse_socket(discovery_port)?;
        let target = SocketAddr::new(IpAddr::V4(MULTICAST_ADDR), discovery_port);

        let announce_socket = UdpSocket::bind(("0.0.0.0", 0))?;
        announce_socket.set_multicast_loop_v4(true)?;

        info!("announcing '{}' on {}", *name.lock().unwrap(), target);

        let mut join_handles = Vec::new();

        {
            let stop = stop.clone();
            let name = name.clone();
            let announce_now = announce_now.clone();

            join_handles.push(std::thread::spawn(move || {
                announce_loop(
                    &announce_socket,
                    &target,
                    &stop,
                    &name,
                    &announce_now,
                    token,
                    rpc_port,
                );
            }));
        }

        {
            let stop = stop.clone();
            let mut state = BrowserState::new(directory, name, token, announce_now);

            join_handles.push(std::thread::spawn(move || {
                browse_loop(&browse_socket, &stop, &mut state);
            }));
        }

        Ok(Discovery {
            stop,
            join_handles: Mutex::new(join_handles),
        })
    }

    /// Browse-only mode for one-shot clients: listens for announcements and
    /// feeds the directory without announcing anything itself.
    pub fn browse(directory: NodeDirectory, discovery_port: u16) -> Result<Discovery> {
        let stop = Arc::new(AtomicBool::new(false));
        let token = instance_token();

        let browse_socket = open_browse_socket(discovery_port)?;

        let mut join_handles = Vec::new();

        {
            let stop = stop.clone();
            let mut state = BrowserState::new(
                directory,
                Arc::new(Mutex::new(String::new())),
                token,
                Arc::new(AtomicBool::new(false)),
            );

            join_handles.push(std::thread::spawn(move || {
                browse_loop(&browse_socket, &stop, &mut state);
            }));
        }

        Ok(Discovery {
            stop,
            join_handles: Mutex::new(join_handles),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);

        let mut join_handles = self.join_handles.lock().unwrap();

        for handle in join_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn open_browse_socket(discovery_port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", discovery_port))?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(POLL_STEP))?;

    Ok(socket)
}

fn announce_loop(
    socket: &UdpSocket,
    target: &SocketAddr,
    stop: &AtomicBool,
    name: &Mutex<String>,
    announce_now: &AtomicBool,
    token: u64,
    rpc_port: u16,
) {
    debug!("announcer started");

    let mut last_announce: Option<Instant> = None;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let due = match last_announce {
            Some(at) => at.elapsed() >= ANNOUNCE_INTERVAL,
            None => true,
        };

        if due || announce_now.swap(false, Ordering::Relaxed) {
            let message = DiscoveryMessage::Announce {
                service: SERVICE_TYPE.to_string(),
                token,
                name: name.lock().unwrap().clone(),
                port: rpc_port,
            };

            if let Err(e) = send_message(socket, target, &message) {
                error!("can't send announcement: {}", e);
            }

            last_announce = Some(Instant::now());
        }

        std::thread::sleep(POLL_STEP);
    }

    let goodbye = DiscoveryMessage::Goodbye {
        service: SERVICE_TYPE.to_string(),
        token,
        name: name.lock().unwrap().clone(),
    };

    if let Err(e) = send_message(socket, target, &goodbye) {
        error!("can't send goodbye: {}", e);
    }

    debug!("announcer stopping");
}

fn send_message(socket: &UdpSocket, target: &SocketAddr, message: &DiscoveryMessage) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    socket.send_to(&payload, target)?;
    Ok(())
}

fn browse_loop(socket: &UdpSocket, stop: &AtomicBool, state: &mut BrowserState) {
    debug!("browser started");

    let mut buf = [0; 2048];

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match socket.recv_from(&mut buf) {
            Ok((n, from)) => match serde_json::from_slice::<DiscoveryMessage>(&buf[0..n]) {
                Ok(message) => state.handle_message(message, from.ip(), Instant::now()),
                Err(e) => {
                    debug!("ignoring malformed datagram from {}: {}", from, e);
                }
            },
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("receive error: {}", e);
                break;
            }
        }

        state.expire(Instant::now());
    }

    debug!("browser stopping");
}

struct BrowserState {
    directory: NodeDirectory,
    name: Arc<Mutex<String>>,
    base_name: String,
    rename_count: u32,
    token: u64,
    announce_now: Arc<AtomicBool>,
    last_seen: HashMap<NodeKey, Instant>,
}

impl BrowserState {
    fn new(
        directory: NodeDirectory,
        name: Arc<Mutex<String>>,
        token: u64,
        announce_now: Arc<AtomicBool>,
    ) -> BrowserState {
        let base_name = name.lock().unwrap().clone();

        BrowserState {
            directory,
            name,
            base_name,
            rename_count: 0,
            token,
            announce_now,
            last_seen: HashMap::new(),
        }
    }

    fn handle_message(&mut self, message: DiscoveryMessage, from: IpAddr, now: Instant) {
        match message {
            DiscoveryMessage::Announce {
                service,
                token,
                name,
                port,
            } => {
                if service != SERVICE_TYPE || token == self.token {
                    return;
                }

                self.check_collision(&name, token);

                let info = NodeInfo {
                    name,
                    address: from,
                    port,
                };

                self.last_seen.insert(info.key(), now);
                self.directory.discovered(info);
            }
            DiscoveryMessage::Goodbye {
                service,
                token,
                name,
            } => {
                if service != SERVICE_TYPE || token == self.token {
                    return;
                }

                let key = NodeKey {
                    name,
                    address: from,
                };

                self.last_seen.remove(&key);
                self.directory.departed(&key);
            }
        }
    }

    // Another instance announced our name. The instance with the higher
    // token yields and renames, so exactly one side moves.
    fn check_collision(&mut self, name: &str, token: u64) {
        let ours = self.name.lock().unwrap().clone();

        if name != ours {
            return;
        }

        if self.token < token {
            debug!("name collision with higher token, keeping '{}'", ours);
            return;
        }

        self.rename_count += 1;
        let renamed = format!("{}-{}", self.base_name, self.rename_count + 1);

        info!("name collision, renaming '{}' -> '{}'", ours, renamed);

        *self.name.lock().unwrap() = renamed;
        self.announce_now.store(true, Ordering::Relaxed);
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<NodeKey> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > EXPIRE_AFTER)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            debug!("node '{}' expired", key.name);
            self.last_seen.remove(&key);
            self.directory.departed(&key);
        }
    }
}
