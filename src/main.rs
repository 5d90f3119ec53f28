#[macro_use]
extern crate log;

mod api;
mod collection;
mod config;
mod db_meta;
mod discovery;
mod error;
mod logger;
mod media;
mod nodes;
mod proto;
mod remote;
mod scan;
mod schema;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Arg;

use config::{NodeConfig, Root};
use discovery::Discovery;
use nodes::{NodeDirectory, NodeEvent};
use scan::ScanThread;
use server::Server;
use store::{Store, StoreSource};

pub struct Mediad {
    pub config: NodeConfig,
    pub name: Arc<Mutex<String>>,
    pub store_source: StoreSource,
    pub directory: NodeDirectory,
}

pub const MEDIAD_VERSION: &str = env!("CARGO_PKG_VERSION");

impl Mediad {
    pub fn store(&self) -> error::Result<Store> {
        Ok(self.store_source.get()?)
    }

    pub fn node_name(&self) -> String {
        self.name.lock().unwrap().clone()
    }
}

fn main() {
    let matches = clap::App::new("mediad")
        .version(MEDIAD_VERSION)
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .help("RPC server address and port")
                .default_value("0.0.0.0:6801"),
        )
        .arg(
            Arg::with_name("directory")
                .long("directory")
                .help("Database directory")
                .default_value("~/.mediad"),
        )
        .arg(
            Arg::with_name("node-name")
                .long("node-name")
                .help("Name announced to other nodes")
                .default_value("mediad"),
        )
        .arg(
            Arg::with_name("discovery-port")
                .long("discovery-port")
                .help("UDP port for node discovery")
                .default_value("6802"),
        )
        .arg(
            Arg::with_name("no-scan")
                .long("no-scan")
                .help("Disable scanning"),
        )
        .arg(
            Arg::with_name("no-announce")
                .long("no-announce")
                .help("Disable network announcement and browsing"),
        )
        .arg(
            Arg::with_name("root")
                .long("root")
                .help("One or more media root directories with unique names")
                .value_names(&["name", "path"])
                .takes_value(true)
                .multiple(true)
                .number_of_values(2),
        )
        .arg(
            Arg::with_name("query")
                .long("query")
                .help("One-shot client mode: query a discovered node and exit")
                .value_names(&["kind", "pattern"])
                .takes_value(true)
                .number_of_values(2),
        )
        .arg(
            Arg::with_name("category")
                .long("category")
                .help("Category filter for --query")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("peer")
                .long("peer")
                .help("Only query the node with this name")
                .takes_value(true),
        )
        .get_matches();

    logger::init();

    if matches.is_present("query") {
        std::process::exit(run_query(&matches));
    }

    info!("{}", MEDIAD_VERSION);

    let mut roots: Vec<Root> = Vec::new();

    if matches.is_present("root") {
        let mut root_iter = matches.values_of("root").unwrap();
        while let Some(name) = root_iter.next() {
            if let Some(path) = root_iter.next() {
                roots.push(Root {
                    name: name.to_string(),
                    path: Path::new(path).to_path_buf(),
                });
            }
        }
    }

    let roots = Arc::new(roots);

    let directory_path = shellexpand::tilde(matches.value_of("directory").unwrap()).into_owned();
    let directory_path = Path::new(&directory_path);

    std::fs::create_dir_all(directory_path).expect("can't create directory");

    let store_source = StoreSource::create(directory_path.join("store.db"), roots)
        .unwrap()
        .expect("unsupported schema version");

    let bind: SocketAddr = matches
        .value_of("bind")
        .unwrap()
        .parse()
        .expect("invalid bind address");

    let discovery_port: u16 = matches
        .value_of("discovery-port")
        .unwrap()
        .parse()
        .expect("invalid discovery port");

    let config = NodeConfig {
        node_name: matches.value_of("node-name").unwrap().to_string(),
        port: bind.port(),
        extensions: media::default_extensions(),
    };

    let name = Arc::new(Mutex::new(config.node_name.clone()));
    let node_directory = NodeDirectory::new();

    let mediad = Arc::new(Mediad {
        config: config.clone(),
        name: name.clone(),
        store_source,
        directory: node_directory.clone(),
    });

    let scan_thread = ScanThread::new();

    if !matches.is_present("no-scan") {
        let store = mediad.store().expect("can't open store");

        if let Err(e) = scan_thread.start(store, config.extensions.clone()) {
            error!("can't start scan: {}", e);
        }
    }

    let discovery = if matches.is_present("no-announce") {
        None
    } else {
        Some(
            Discovery::launch(node_directory, name, config.port, discovery_port)
                .expect("can't start discovery"),
        )
    };

    let tcp_listener = mio::net::TcpListener::bind(&bind).expect("can't bind server address");

    let server_incoming = Server::launch_new().expect("can't launch server");
    server_incoming.add_listener(tcp_listener).expect("can't add listener");

    api::run_api(mediad, server_incoming);

    if let Some(discovery) = discovery {
        discovery.stop();
    }

    scan_thread.stop();
}

const QUERY_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(6);
const QUERY_FACT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ad hoc one-shot query against a discovered node: browse for a peer,
/// connect, evaluate the collection and print one line per item.
fn run_query(matches: &clap::ArgMatches) -> i32 {
    let mut query_values = matches.values_of("query").unwrap();
    let kind_arg = query_values.next().unwrap();
    let pattern = query_values.next().unwrap();

    let kind = match media::MediaKind::from_str(kind_arg) {
        Some(k) => k,
        None => {
            eprintln!("unknown media kind '{}'", kind_arg);
            return 2;
        }
    };

    let discovery_port: u16 = matches
        .value_of("discovery-port")
        .unwrap()
        .parse()
        .expect("invalid discovery port");

    let directory = NodeDirectory::new();

    let (added_tx, added_rx) = mpsc::channel();
    directory.add_listener(move |event| {
        if let NodeEvent::Added(info) = event {
            let _ = added_tx.send(info.clone());
        }
    });

    let discovery = match Discovery::browse(directory.clone(), discovery_port) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("can't browse for nodes: {}", e);
            return 1;
        }
    };

    let wanted_peer = matches.value_of("peer");
    let deadline = Instant::now() + QUERY_DISCOVERY_TIMEOUT;

    let info = loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(r) => r,
            None => {
                eprintln!("no matching node found");
                discovery.stop();
                return 1;
            }
        };

        match added_rx.recv_timeout(remaining) {
            Ok(info) => match wanted_peer {
                Some(name) if info.name != name => continue,
                _ => break info,
            },
            Err(_) => {
                eprintln!("no matching node found");
                discovery.stop();
                return 1;
            }
        }
    };

    let result = query_node(&directory, &info, kind, matches.value_of("category"), pattern);

    discovery.stop();

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("query failed: {}", e);
            1
        }
    }
}

fn query_node(
    directory: &NodeDirectory,
    info: &nodes::NodeInfo,
    kind: media::MediaKind,
    category: Option<&str>,
    pattern: &str,
) -> error::Result<()> {
    directory.connect(&info.key())?;

    let link = match directory.link(&info.key()) {
        Some(l) => l,
        None => return Err(error::Error::Unreachable),
    };

    let node_config = link.get_config()?;
    eprintln!(
        "node '{}' ({}:{}) mediad {}",
        node_config.node_name, info.address, node_config.port, node_config.version
    );

    let descriptor = collection::Collection::new(kind, category, pattern);
    let target = collection::Target::Remote(&link);

    let items = collection::evaluate(&target, &descriptor)?;

    for item in items {
        // preferred fact first, falling back field by field, the indexed
        // path last
        let display = fetch_fact(&target, item.file_id, "clean_name")
            .or_else(|| fetch_fact(&target, item.file_id, "name"))
            .unwrap_or_else(|| item.path.clone());

        println!("{}\t{}", item.path, display);
    }

    Ok(())
}

fn fetch_fact(target: &collection::Target, file_id: i64, fact_name: &str) -> Option<String> {
    let (tx, rx) = mpsc::channel();

    remote::request_fact(target, file_id, fact_name, move |reply| {
        let _ = tx.send(reply);
    });

    match rx.recv_timeout(QUERY_FACT_TIMEOUT) {
        Ok(remote::FactReply::Value(value)) => Some(value),
        _ => None,
    }
}
