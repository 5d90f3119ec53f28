use std::path::Path;
use std::sync::Arc;

use threadpool::ThreadPool;

use crate::collection::{self, Collection};
use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::proto::{self, ConfigInfo, Entry, Op, Request, Response, ResponseBody, Source};
use crate::server::{IncomingResult, ServerIncoming};
use crate::Mediad;

const WORKERS: usize = 4;

/// Serves RPC requests until the server shuts down. Handlers run on a
/// worker pool so a slow store query never stalls the incoming loop.
pub fn run_api(mediad: Arc<Mediad>, server: ServerIncoming) {
    let pool = ThreadPool::new(WORKERS);

    loop {
        let result = server.receive_next_fn(|buffer| proto::read_frames::<Request>(buffer));

        match result {
            Ok(IncomingResult::Request(client, requests)) => {
                for request in requests {
                    let mediad = mediad.clone();
                    let client = client.clone();

                    pool.execute(move || {
                        trace!("request {} {:?}", request.request_id, request.op);

                        let body = match process_request(&mediad, request.op) {
                            Ok(body) => body,
                            Err(e) => {
                                error!("request {} failed: {}", request.request_id, e);
                                ResponseBody::Error {
                                    message: e.to_string(),
                                }
                            }
                        };

                        let response = Response {
                            request_id: request.request_id,
                            body,
                        };

                        match proto::encode_frame(&response) {
                            Ok(frame) => {
                                if let Err(e) = client.send(&frame) {
                                    error!("can't send response: {}", e);
                                }
                            }
                            Err(e) => {
                                error!("can't encode response: {}", e);
                            }
                        }
                    });
                }
            }
            Ok(IncomingResult::Shutdown) => break,
            Err(e) => {
                error!("receive error: {}", e);
                break;
            }
        }
    }

    pool.join();
}

fn process_request(mediad: &Mediad, op: Op) -> Result<ResponseBody> {
    match op {
        Op::GetSources => get_sources(mediad),
        Op::GetDirectory { path } => get_directory(mediad, &path),
        Op::GetCollection {
            kind,
            category,
            pattern,
        } => get_collection(mediad, kind, category, pattern),
        Op::GetFact { file_id, fact_name } => get_fact(mediad, file_id, &fact_name),
        Op::GetConfig => get_config(mediad),
    }
}

fn get_sources(mediad: &Mediad) -> Result<ResponseBody> {
    let store = mediad.store()?;

    let sources = store
        .roots()
        .iter()
        .map(|root| Source {
            path: root.name.clone(),
        })
        .collect();

    Ok(ResponseBody::Sources { sources })
}

fn get_directory(mediad: &Mediad, path: &str) -> Result<ResponseBody> {
    let store = mediad.store()?;

    if path.is_empty() {
        let entries = store
            .roots()
            .iter()
            .map(|root| Entry {
                path: root.name.clone(),
                friendly_name: root.name.clone(),
                is_file: false,
            })
            .collect();

        return Ok(ResponseBody::Directory { entries });
    }

    let fs_path = match store.map_fs_path(Path::new(path)) {
        Some(p) => p,
        None => {
            return Err(Error::OtherError);
        }
    };

    let mut entries: Vec<Entry> = Vec::new();

    for entry in std::fs::read_dir(&fs_path)? {
        let entry = entry?;

        let friendly_name = match entry.file_name().to_str() {
            Some(n) => n.to_string(),
            None => continue,
        };

        let is_file = entry.file_type()?.is_file();

        entries.push(Entry {
            path: format!("{}/{}", path, friendly_name),
            friendly_name,
            is_file,
        });
    }

    entries.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));

    Ok(ResponseBody::Directory { entries })
}

fn get_collection(
    mediad: &Mediad,
    kind: MediaKind,
    category: Option<String>,
    pattern: String,
) -> Result<ResponseBody> {
    let store = mediad.store()?;

    let descriptor = Collection {
        kind,
        category,
        pattern,
    };

    let items = collection::evaluate_local(&store, &descriptor)?;

    Ok(ResponseBody::Collection { items })
}

fn get_fact(mediad: &Mediad, file_id: i64, fact_name: &str) -> Result<ResponseBody> {
    let store = mediad.store()?;

    let value = store.get_fact(file_id, fact_name)?;

    Ok(ResponseBody::Fact { value })
}

fn get_config(mediad: &Mediad) -> Result<ResponseBody> {
    Ok(ResponseBody::Config {
        config: ConfigInfo {
            version: crate::MEDIAD_VERSION.to_string(),
            node_name: mediad.node_name(),
            port: mediad.config.port,
            supported_extensions: mediad.config.extensions.clone(),
        },
    })
}
