//! Tiny HTTP/1.1 server answering canned responses, standing in for GitHub and Hugging Face.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(body: &serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.as_bytes().to_vec(),
        }
    }
}

#[derive(Default)]
struct Routes {
    responses: HashMap<String, MockResponse>,
    hits: HashMap<String, usize>,
}

pub struct MockHttpServer {
    addr: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    task: JoinHandle<()>,
}

impl MockHttpServer {
    /// Binds a random loopback port and starts answering requests in the background.
    ///
    /// Unknown paths get a 404.
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("bind mock HTTP server")?;
        let addr = listener.local_addr()?;

        let routes = Arc::new(Mutex::new(Routes::default()));

        let task = tokio::spawn({
            let routes = Arc::clone(&routes);

            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    tokio::spawn(async move {
                        if let Err(error) = handle_connection(stream, routes).await {
                            eprintln!("mock HTTP server: {error:#}");
                        }
                    });
                }
            }
        });

        Ok(Self { addr, routes, task })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url())
    }

    pub fn route(&self, path: &str, response: MockResponse) {
        self.routes.lock().unwrap().responses.insert(path.to_owned(), response);
    }

    /// Number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.routes.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, routes: Arc<Mutex<Routes>>) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let path = request_line
        .split_whitespace()
        .nth(1)
        .context("malformed request line")?
        .to_owned();

    let mut content_length = 0;

    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await?;

        let header = header.trim_end();
        if header.is_empty() {
            break;
        }

        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().context("invalid content-length")?;
            }
        }
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;

    let response = {
        let mut routes = routes.lock().unwrap();
        *routes.hits.entry(path.clone()).or_default() += 1;
        routes
            .responses
            .get(&path)
            .cloned()
            .unwrap_or_else(|| MockResponse::status(404, "not found"))
    };

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len()
    );

    let mut stream = reader.into_inner();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.shutdown().await?;

    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
