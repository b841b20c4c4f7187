//! A minimal in-process OCI-distribution-shaped HTTP server: just enough of
//! `GET`/`PUT /v2/<repo>/manifests/<ref>` to drive `RegistryClient` against
//! real sockets without a real registry. Plain HTTP only — paired with
//! `TlsTrust { insecure: true, .. }` on the client side.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::Digest;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone)]
struct Manifest {
    body: Vec<u8>,
    content_type: String,
}

pub struct MockRegistry {
    pub host: String,
    manifests: Arc<Mutex<HashMap<(String, String), Manifest>>>,
}

impl MockRegistry {
    /// Starts the server on an ephemeral local port and spawns its accept
    /// loop on the current tokio runtime.
    pub async fn start() -> MockRegistry {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock registry");
        let addr = listener.local_addr().expect("mock registry local addr");
        let manifests: Arc<Mutex<HashMap<(String, String), Manifest>>> = Arc::new(Mutex::new(HashMap::new()));

        let state = Arc::clone(&manifests);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&state);
                tokio::spawn(handle_connection(socket, state));
            }
        });

        MockRegistry {
            host: addr.to_string(),
            manifests,
        }
    }

    /// Pre-populates a manifest (or index) so `GET` finds it immediately —
    /// used to simulate an already-cached base image (S2) or a locked
    /// source digest.
    pub async fn seed(&self, repo: &str, reference: &str, body: Vec<u8>, content_type: &str) {
        self.manifests.lock().await.insert(
            (repo.to_string(), reference.to_string()),
            Manifest {
                body,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn repo(&self, name: &str) -> String {
        format!("{}/{}", self.host, name)
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, state: Arc<Mutex<HashMap<(String, String), Manifest>>>) {
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length: usize = 0;
    let mut request_content_type = "application/octet-stream".to_string();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "content-type" => request_content_type = value.trim().to_string(),
                _ => {}
            }
        }
    }

    let Some((repo, reference)) = parse_manifest_path(&path) else {
        write_response(&mut reader, 404, "", &[], b"").await;
        return;
    };

    match method.as_str() {
        "GET" | "HEAD" => {
            let found = state.lock().await.get(&(repo.clone(), reference.clone())).cloned();
            match found {
                Some(m) => {
                    let digest = digest_of(&m.body);
                    write_response(&mut reader, 200, &m.content_type, &[("Docker-Content-Digest", &digest)], &m.body).await;
                }
                None => write_response(&mut reader, 404, "", &[], b"").await,
            }
        }
        "PUT" => {
            let mut body = vec![0u8; content_length];
            if content_length > 0 {
                let _ = reader.read_exact(&mut body).await;
            }
            let digest = digest_of(&body);
            state.lock().await.insert(
                (repo, reference),
                Manifest {
                    body,
                    content_type: request_content_type,
                },
            );
            write_response(&mut reader, 201, "", &[("Docker-Content-Digest", &digest)], b"").await;
        }
        _ => write_response(&mut reader, 405, "", &[], b"").await,
    }
}

fn parse_manifest_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/v2/")?;
    let (repo, reference) = rest.rsplit_once("/manifests/")?;
    Some((repo.to_string(), reference.to_string()))
}

fn digest_of(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(body)))
}

async fn write_response(
    stream: &mut BufReader<tokio::net::TcpStream>,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let mut response = format!("HTTP/1.1 {} {}\r\nContent-Length: {}\r\n", status, reason, body.len());
    if !content_type.is_empty() {
        response.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.flush().await;
}
