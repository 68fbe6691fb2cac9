//! Socket-level tests for the stock hyper transport against a minimal
//! in-process HTTP/1.1 server.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqflow::prelude::*;

#[derive(Clone)]
struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CannedResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into().into_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;
                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    Ok(CapturedRequest {
        method,
        path,
        headers,
    })
}

fn write_response(stream: &mut TcpStream, response: &CannedResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn manager_for(server: &MockServer) -> Manager {
    let environment =
        Environment::new(format!("{}/v1", server.base_url)).expect("environment");
    Manager::builder(environment).try_build().expect("manager")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_over_real_sockets_parses_json() {
    let server = MockServer::start(vec![CannedResponse::new(
        200,
        vec![("Content-Type", "application/json; charset=utf-8")],
        r#"{"results":["cat"]}"#,
    )]);
    let manager = manager_for(&server);

    let task = manager
        .get("search")
        .param("query", "cats")
        .parse_as_json()
        .send(&manager)
        .expect("spawn");
    let (response, value) = task.join().await.success().expect("success");

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.mime_type.as_deref(), Some("application/json"));
    assert_eq!(value["results"][0], "cat");

    let requests = server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/v1/search?query=cats");
    assert_eq!(
        requests[0].headers.get("accept").map(String::as_str),
        Some("application/json, text/json")
    );
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirects_are_followed_by_the_transport() {
    let server = MockServer::start(vec![
        CannedResponse::new(302, vec![("Location", "/v2/search")], ""),
        CannedResponse::new(
            200,
            vec![("Content-Type", "application/json")],
            r#"{"ok":true}"#,
        ),
    ]);
    let manager = manager_for(&server);

    let task = manager
        .get("search")
        .parse_as_json()
        .send(&manager)
        .expect("spawn");
    let (response, value) = task.join().await.success().expect("success");

    assert_eq!(server.served_count(), 2);
    assert_eq!(value["ok"], true);
    assert_eq!(response.url.path(), "/v2/search");
    assert_eq!(server.requests()[1].path, "/v2/search");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_redirect_following_surfaces_the_redirect() {
    let server = MockServer::start(vec![CannedResponse::new(
        302,
        vec![("Location", "/v2/search")],
        "",
    )]);
    let manager = manager_for(&server);

    let task = manager
        .get("search")
        .follow_redirects(false)
        .parse_as_json()
        .send(&manager)
        .expect("spawn");
    match task.join().await {
        TaskResult::Error(_, Error::UnexpectedRedirect { status, location, .. }) => {
            assert_eq!(status.as_u16(), 302);
            assert_eq!(location.expect("location").path(), "/v2/search");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(server.served_count(), 1);
}
