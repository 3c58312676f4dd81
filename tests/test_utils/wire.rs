//! Raw socket helpers for frame-level tests

use std::net::SocketAddr;

use pgharness::protocol::message::{backend, frontend};
use pgharness::protocol::startup::PROTOCOL_VERSION_3;
use pgharness::protocol::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One backend message: tag and body without the length word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl Message {
    /// Authentication request code of an `R` message
    pub fn auth_code(&self) -> Option<u32> {
        (self.tag == backend::AUTHENTICATION && self.body.len() >= 4)
            .then(|| u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]))
    }

    /// SQLSTATE of an `E` message
    pub fn sqlstate(&self) -> Option<String> {
        if self.tag != backend::ERROR_RESPONSE {
            return None;
        }
        self.fields()
            .into_iter()
            .find(|(code, _)| *code == b'C')
            .map(|(_, value)| value)
    }

    /// Command tag of a `C` message
    pub fn command_tag(&self) -> Option<String> {
        (self.tag == backend::COMMAND_COMPLETE).then(|| cstr(&self.body))
    }

    /// Text values of a `D` message
    pub fn data_row(&self) -> Option<Vec<Option<String>>> {
        if self.tag != backend::DATA_ROW {
            return None;
        }
        let count = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        let mut pos = 2;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = i32::from_be_bytes([
                self.body[pos],
                self.body[pos + 1],
                self.body[pos + 2],
                self.body[pos + 3],
            ]);
            pos += 4;
            if len < 0 {
                values.push(None);
            } else {
                let end = pos + len as usize;
                values.push(Some(String::from_utf8_lossy(&self.body[pos..end]).into_owned()));
                pos = end;
            }
        }
        Some(values)
    }

    fn fields(&self) -> Vec<(u8, String)> {
        let mut fields = Vec::new();
        let mut rest = &self.body[..];
        while let Some((&code, tail)) = rest.split_first() {
            if code == 0 {
                break;
            }
            let value = cstr(tail);
            rest = &tail[value.len() + 1..];
            fields.push((code, value));
        }
        fields
    }
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn startup_frame(user: &str, database: &str) -> Vec<u8> {
    let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut frame = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

pub fn password_frame(password: &str) -> Vec<u8> {
    let mut body = password.as_bytes().to_vec();
    body.push(0);
    Frame::new(frontend::PASSWORD, &body).into_bytes()
}

pub fn query_frame(sql: &str) -> Vec<u8> {
    let mut body = sql.as_bytes().to_vec();
    body.push(0);
    Frame::new(frontend::QUERY, &body).into_bytes()
}

pub fn terminate_frame() -> Vec<u8> {
    Frame::new(frontend::TERMINATE, &[]).into_bytes()
}

pub async fn read_message(stream: &mut TcpStream) -> Message {
    let tag = stream.read_u8().await.expect("read tag");
    let len = stream.read_u32().await.expect("read length") as usize;
    let mut body = vec![0; len - 4];
    stream.read_exact(&mut body).await.expect("read body");
    Message { tag, body }
}

/// Read messages up to and including `ReadyForQuery`
pub async fn read_until_ready(stream: &mut TcpStream) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        let message = read_message(stream).await;
        let done = message.tag == backend::READY_FOR_QUERY;
        messages.push(message);
        if done {
            return messages;
        }
    }
}

/// Connect and finish the cleartext-password handshake
pub async fn connect_authenticated(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect to bridge");
    stream
        .write_all(&startup_frame("postgres", "postgres"))
        .await
        .unwrap();
    let request = read_message(&mut stream).await;
    assert_eq!(request.auth_code(), Some(3), "expected cleartext password request");

    stream.write_all(&password_frame("anything")).await.unwrap();
    let welcome = read_until_ready(&mut stream).await;
    assert_eq!(welcome[0].auth_code(), Some(0));
    stream
}

/// Send one simple query and collect its reply
pub async fn simple_query(stream: &mut TcpStream, sql: &str) -> Vec<Message> {
    stream.write_all(&query_frame(sql)).await.unwrap();
    read_until_ready(stream).await
}
