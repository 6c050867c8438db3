//! Minimal HTTP/1.1 file server with byte-range support.
//!
//! Covers failure modes wiremock cannot produce: connections dropped in the
//! middle of a body, and bodies trickled slowly enough to pause mid-transfer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::socket_guard::should_skip_socket_bound_test;

#[derive(Debug)]
struct State {
    body: Vec<u8>,
    etag: String,
    honor_range: bool,
    /// Close the connection after this many body bytes, next GET only.
    drop_after: Option<usize>,
    trickle: Option<(usize, Duration)>,
    /// `Range` header of every GET received, in order.
    gets: Vec<Option<String>>,
}

pub struct FileServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FileServer {
    /// Starts serving `body` at every path, or returns `None` when sockets
    /// are unavailable.
    pub async fn start(body: Vec<u8>, etag: &str) -> Option<Self> {
        if should_skip_socket_bound_test() {
            return None;
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind file server");
        let addr = listener.local_addr().expect("file server address");
        let state = Arc::new(Mutex::new(State {
            body,
            etag: etag.to_string(),
            honor_range: true,
            drop_after: None,
            trickle: None,
            gets: Vec::new(),
        }));
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Some(Self { addr, state, task })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set_etag(&self, etag: &str) {
        self.state().etag = etag.to_string();
    }

    pub fn set_body(&self, body: Vec<u8>) {
        self.state().body = body;
    }

    pub fn drop_next_get_after(&self, bytes: usize) {
        self.state().drop_after = Some(bytes);
    }

    /// Sends bodies `chunk` bytes at a time with `delay` between chunks.
    pub fn trickle(&self, chunk: usize, delay: Duration) {
        self.state().trickle = Some((chunk, delay));
    }

    pub fn stop_trickle(&self) {
        self.state().trickle = None;
    }

    /// Answers ranged requests with the full body and status 200.
    pub fn ignore_ranges(&self) {
        self.state().honor_range = false;
    }

    pub fn range_headers(&self) -> Vec<Option<String>> {
        self.state().gets.clone()
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<State>>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, Arc::clone(&state)));
    }
}

struct Reply {
    head: String,
    body: Vec<u8>,
    drop_after: Option<usize>,
    trickle: Option<(usize, Duration)>,
}

fn plan(state: &mut State, method: &str, range: Option<String>) -> Reply {
    let len = state.body.len();
    let is_get = method.eq_ignore_ascii_case("GET");
    if is_get {
        state.gets.push(range.clone());
    }

    let start = range
        .as_deref()
        .filter(|_| state.honor_range)
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse::<usize>().ok());

    let (status, extra, body) = match start {
        Some(start) if start >= len => (
            "416 Range Not Satisfiable",
            format!("Content-Range: bytes */{len}\r\n"),
            Vec::new(),
        ),
        Some(start) => (
            "206 Partial Content",
            format!("Content-Range: bytes {start}-{}/{len}\r\n", len - 1),
            state.body[start..].to_vec(),
        ),
        None => ("200 OK", String::new(), state.body.clone()),
    };

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nETag: {}\r\nAccept-Ranges: bytes\r\n{extra}Connection: close\r\n\r\n",
        body.len(),
        state.etag
    );
    Reply {
        head,
        body: if is_get { body } else { Vec::new() },
        drop_after: if is_get { state.drop_after.take() } else { None },
        trickle: state.trickle,
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
        return;
    }
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();

    let reply = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        plan(&mut state, &method, range)
    };

    if writer.write_all(reply.head.as_bytes()).await.is_err() {
        return;
    }
    let body = match reply.drop_after {
        Some(limit) => &reply.body[..limit.min(reply.body.len())],
        None => &reply.body[..],
    };
    match reply.trickle {
        Some((chunk, delay)) => {
            for part in body.chunks(chunk.max(1)) {
                if writer.write_all(part).await.is_err() || writer.flush().await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        }
        None => {
            if writer.write_all(body).await.is_err() {
                return;
            }
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
