use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
};

use anyhow::Error;
use flate2::{write::GzEncoder, Compression};

/// A canned-reply HTTP server on a loopback port.
///
/// Every connection gets the reply routed by its request path, then is closed.
pub struct TestServer {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Request lines received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

pub fn given_server(routes: Vec<(&str, Vec<u8>)>) -> Result<TestServer, Error> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let routes: HashMap<String, Vec<u8>> = routes
        .into_iter()
        .map(|(path, reply)| (path.to_string(), reply))
        .collect();
    let routes = Arc::new(routes);
    let requests = Arc::new(Mutex::new(Vec::new()));

    let server_requests = requests.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };

            let routes = routes.clone();
            let requests = server_requests.clone();
            thread::spawn(move || serve(stream, &routes, &requests));
        }
    });

    Ok(TestServer { port, requests })
}

fn serve(mut stream: TcpStream, routes: &HashMap<String, Vec<u8>>, requests: &Mutex<Vec<String>>) {
    let mut head = Vec::new();
    let mut buffer = [0; 1024];

    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => return,
            Ok(count) => head.extend_from_slice(&buffer[..count]),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let line = head.lines().next().unwrap_or_default().to_string();
    let path = line.split(' ').nth(1).unwrap_or_default().to_string();
    requests.lock().unwrap().push(line);

    let reply = routes.get(&path).cloned().unwrap_or_else(not_found);
    let _ = stream.write_all(&reply);
}

pub fn ok(body: &[u8]) -> Vec<u8> {
    let mut reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    reply.extend_from_slice(body);
    reply
}

/// A 200 with no length, delimited by the server closing.
pub fn ok_until_close(body: &[u8]) -> Vec<u8> {
    let mut reply = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
    reply.extend_from_slice(body);
    reply
}

/// A gzip-encoded 200, sent in chunks of `chunk_size`.
pub fn ok_gzip_chunked(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut reply =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
    for chunk in compressed.chunks(chunk_size) {
        reply.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        reply.extend_from_slice(chunk);
        reply.extend_from_slice(b"\r\n");
    }
    reply.extend_from_slice(b"0\r\n\r\n");
    reply
}

pub fn found(location: &str) -> Vec<u8> {
    format!("HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n", location)
        .into_bytes()
}

pub fn not_found() -> Vec<u8> {
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
}

pub const GIF: &[u8] = b"GIF89a\x01\x00\x01\x00strip";
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\nstrip";
