use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::remote::NodeLink;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeState {
    Discovered,
    Connecting,
    Connected,
}

/// Name plus address identify a node instance for the lifetime of a
/// discovery session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub name: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl NodeInfo {
    pub fn key(&self) -> NodeKey {
        NodeKey {
            name: self.name.clone(),
            address: self.address,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Added(NodeInfo),
    Updated(NodeInfo),
    Connected(NodeInfo),
    ConnectFailed(NodeInfo),
    Disconnected(NodeInfo),
    Removed(NodeInfo),
}

type Listener = Box<dyn Fn(&NodeEvent) + Send>;

struct NodeEntry {
    info: NodeInfo,
    state: NodeState,
    link: Option<NodeLink>,
}

struct DirectoryInner {
    nodes: HashMap<NodeKey, NodeEntry>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// The set of known peer nodes and their connection state machines. An
/// explicit instance owned by the daemon context; handles clone cheaply.
#[derive(Clone)]
pub struct NodeDirectory {
    inner: Arc<Mutex<DirectoryInner>>,
}

impl NodeDirectory {
    pub fn new() -> NodeDirectory {
        NodeDirectory {
            inner: Arc::new(Mutex::new(DirectoryInner {
                nodes: HashMap::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&NodeEvent) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();

        inner.next_listener_id += 1;
        let id = inner.next_listener_id;

        inner.listeners.push((id, Box::new(listener)));

        id
    }

    /// Detaches a listener; no further events are delivered to it.
    pub fn remove_listener(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn nodes(&self) -> Vec<(NodeInfo, NodeState)> {
        let inner = self.inner.lock().unwrap();

        inner
            .nodes
            .values()
            .map(|entry| (entry.info.clone(), entry.state))
            .collect()
    }

    pub fn link(&self, key: &NodeKey) -> Option<NodeLink> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(key).and_then(|entry| entry.link.clone())
    }

    /// Discovery feed: a peer announcement was seen. Fires Added for a new
    /// node, Updated when the announced metadata changed, nothing for a
    /// plain refresh.
    pub fn discovered(&self, info: NodeInfo) {
        let mut inner = self.inner.lock().unwrap();
        let key = info.key();

        match inner.nodes.get_mut(&key) {
            Some(entry) => {
                if entry.info != info {
                    debug!("node '{}' updated", info.name);
                    entry.info = info.clone();
                    fire(&inner, &NodeEvent::Updated(info));
                }
            }
            None => {
                debug!("node '{}' at {} discovered", info.name, info.address);

                inner.nodes.insert(
                    key,
                    NodeEntry {
                        info: info.clone(),
                        state: NodeState::Discovered,
                        link: None,
                    },
                );

                fire(&inner, &NodeEvent::Added(info));
            }
        }
    }

    /// Discovery feed: the peer withdrew its announcement or expired.
    pub fn departed(&self, key: &NodeKey) {
        let mut inner = self.inner.lock().unwrap();

        let entry = match inner.nodes.remove(key) {
            Some(e) => e,
            None => return,
        };

        debug!("node '{}' departed", entry.info.name);

        match entry.state {
            NodeState::Connected => {
                fire(&inner, &NodeEvent::Disconnected(entry.info.clone()));

                if let Some(link) = entry.link {
                    link.close();
                }
            }
            _ => {
                fire(&inner, &NodeEvent::Removed(entry.info.clone()));
            }
        }
    }

    /// Drives Discovered -> Connecting -> Connected. Failure returns the
    /// node to Discovered; retry is the caller's decision.
    pub fn connect(&self, key: &NodeKey) -> Result<()> {
        let info = {
            let mut inner = self.inner.lock().unwrap();

            let entry = match inner.nodes.get_mut(key) {
                Some(e) => e,
                None => return Err(Error::Unreachable),
            };

            if entry.state != NodeState::Discovered {
                return Ok(());
            }

            entry.state = NodeState::Connecting;
            entry.info.clone()
        };

        debug!("connecting to '{}' at {}", info.name, info.socket_addr());

        let directory = self.clone();
        let close_key = key.clone();

        let connected = NodeLink::connect(&info.socket_addr(), move || {
            directory.link_closed(&close_key);
        });

        let mut inner = self.inner.lock().unwrap();

        match connected {
            Ok(link) => {
                match inner.nodes.get_mut(key) {
                    Some(entry) => {
                        entry.state = NodeState::Connected;
                        entry.link = Some(link);
                        fire(&inner, &NodeEvent::Connected(info));
                    }
                    None => {
                        // departed while we were connecting
                        link.close();
                    }
                }

                Ok(())
            }
            Err(e) => {
                error!("can't connect to '{}': {}", info.name, e);

                if let Some(entry) = inner.nodes.get_mut(key) {
                    entry.state = NodeState::Discovered;
                    entry.link = None;
                    fire(&inner, &NodeEvent::ConnectFailed(info));
                }

                Err(e)
            }
        }
    }

    // Reader-thread notification of transport loss. Fires exactly one
    // Disconnected and drops the node from the directory.
    fn link_closed(&self, key: &NodeKey) {
        let mut inner = self.inner.lock().unwrap();

        let connected = match inner.nodes.get(key) {
            Some(entry) => entry.state == NodeState::Connected,
            None => false,
        };

        if connected {
            let entry = inner.nodes.remove(key).unwrap();

            debug!("node '{}' disconnected", entry.info.name);

            fire(&inner, &NodeEvent::Disconnected(entry.info));
        }
    }
}

// Delivery happens under the directory lock: events for one node reach
// every listener in transition order. Listeners must not reenter the
// directory.
fn fire(inner: &DirectoryInner, event: &NodeEvent) {
    for (_, listener) in &inner.listeners {
        listener(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_info(port: u16) -> NodeInfo {
        NodeInfo {
            name: "peer".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    fn event_channel(directory: &NodeDirectory) -> mpsc::Receiver<NodeEvent> {
        let (tx, rx) = mpsc::channel();
        directory.add_listener(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    #[test]
    fn added_fires_exactly_once() {
        let directory = NodeDirectory::new();
        let rx = event_channel(&directory);

        directory.discovered(test_info(6801));
        directory.discovered(test_info(6801));
        directory.discovered(test_info(6801));

        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Added(test_info(6801)));
        assert!(rx.try_recv().is_err());
        assert_eq!(directory.nodes().len(), 1);
    }

    #[test]
    fn metadata_change_fires_updated() {
        let directory = NodeDirectory::new();
        let rx = event_channel(&directory);

        directory.discovered(test_info(6801));
        directory.discovered(test_info(6900));

        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Added(test_info(6801)));
        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Updated(test_info(6900)));
    }

    #[test]
    fn withdrawn_before_connect_is_removed() {
        let directory = NodeDirectory::new();
        let rx = event_channel(&directory);

        let info = test_info(6801);
        directory.discovered(info.clone());
        directory.departed(&info.key());

        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Added(info.clone()));
        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Removed(info));
        assert!(directory.nodes().is_empty());
    }

    #[test]
    fn connect_then_transport_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let directory = NodeDirectory::new();
        let rx = event_channel(&directory);

        let info = test_info(port);
        directory.discovered(info.clone());
        directory.connect(&info.key()).unwrap();

        let (server, _) = listener.accept().unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            NodeEvent::Added(info.clone())
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            NodeEvent::Connected(info.clone())
        );

        drop(server);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            NodeEvent::Disconnected(info)
        );

        // exactly one disconnect, node gone from listings
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(directory.nodes().is_empty());
    }

    #[test]
    fn failed_connect_returns_to_discovered() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let directory = NodeDirectory::new();
        let rx = event_channel(&directory);

        let info = test_info(port);
        directory.discovered(info.clone());

        assert!(directory.connect(&info.key()).is_err());

        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::Added(info.clone())
        );
        assert_eq!(rx.try_recv().unwrap(), NodeEvent::ConnectFailed(info));

        let nodes = directory.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].1, NodeState::Discovered);
    }

    #[test]
    fn detached_listener_stops_receiving() {
        let directory = NodeDirectory::new();

        let (tx, rx) = mpsc::channel();
        let id = directory.add_listener(move |event| {
            let _ = tx.send(event.clone());
        });

        directory.discovered(test_info(6801));
        assert!(rx.try_recv().is_ok());

        directory.remove_listener(id);
        directory.departed(&test_info(6801).key());

        assert!(rx.try_recv().is_err());
    }
}
