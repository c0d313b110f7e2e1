//! Test harness for driving a real session server over loopback.
//!
//! Spawns the `tether --internal NAME` server entry point with an
//! isolated HOME, waits for the rendezvous files, and speaks the real
//! wire protocol through the codec crate.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tether_protocol::{MessageKind, MessageReader, MessageWriter};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
pub const IO_TIMEOUT: Duration = Duration::from_secs(15);

/// A running session server. Kills the process and removes its state on
/// drop, so a failing test does not leak servers.
pub struct ServerHandle {
    pub child: Child,
    pub session_dir: PathBuf,
    _home: tempfile::TempDir,
}

impl ServerHandle {
    pub fn addr(&self) -> String {
        std::fs::read_to_string(self.session_dir.join("addr"))
            .expect("addr file")
            .trim()
            .to_string()
    }

    /// Wait for the server process to exit on its own.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn a server for `name` under a fresh temporary HOME and wait for
/// it to publish its address.
pub fn spawn_server(name: &str) -> ServerHandle {
    let home = tempfile::tempdir().expect("tempdir");
    let root = home.path().join(".tether");
    let session_dir = root.join(format!("@{name}"));

    let child = Command::new(env!("CARGO_BIN_EXE_tether"))
        .arg("--internal")
        .arg(name)
        .env("HOME", home.path())
        .env_remove("XDG_CONFIG_HOME")
        .env_remove("_PTY_SHELL")
        .env_remove("SSH_AUTH_SOCK")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawning server");

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while !session_dir.join("addr").exists() || !session_dir.join("pid").exists() {
        assert!(
            Instant::now() < deadline,
            "server did not publish its address in time"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    ServerHandle {
        child,
        session_dir,
        _home: home,
    }
}

#[derive(Debug)]
pub enum Event {
    Data(Vec<u8>),
    Message(u8, Vec<u8>),
    Eof,
}

/// One attached test client: a codec writer plus an ordered stream of
/// decoded events from the server.
pub struct TestClient {
    pub writer: MessageWriter<OwnedWriteHalf>,
    events: mpsc::UnboundedReceiver<Event>,
    pub screen: Vec<u8>,
}

impl TestClient {
    pub async fn connect(server: &ServerHandle) -> TestClient {
        let stream = TcpStream::connect(server.addr())
            .await
            .expect("dialing server");
        let (read_half, write_half) = stream.into_split();
        let (tx, events) = mpsc::unbounded_channel();
        let message_tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = MessageReader::new(read_half, move |kind, payload: &[u8]| {
                let _ = message_tx.send(Event::Message(kind, payload.to_vec()));
            });
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Event::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx.send(Event::Eof);
        });
        TestClient {
            writer: MessageWriter::new(write_half),
            events,
            screen: Vec::new(),
        }
    }

    /// Identify ourselves the way a real client does on attach.
    pub async fn identify(&self, pid: u32, name: &str) {
        self.writer
            .send(MessageKind::TtyName, format!("{pid}:{name}").as_bytes())
            .await
            .expect("ttyname");
    }

    /// Wait for a message of `kind`, buffering data and discarding other
    /// messages along the way.
    pub async fn expect_message(&mut self, kind: MessageKind) -> Vec<u8> {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .unwrap_or_else(|| panic!("stream ended waiting for {kind}"));
            match event {
                Event::Data(data) => self.screen.extend_from_slice(&data),
                Event::Message(k, payload) if k == kind as u8 => return payload,
                Event::Message(_, _) => {}
                Event::Eof => panic!("EOF while waiting for {kind}"),
            }
        }
    }

    /// Accumulate screen data until `needle` appears in it.
    pub async fn wait_for_output(&mut self, needle: &[u8]) {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if self
                .screen
                .windows(needle.len().max(1))
                .any(|w| w == needle)
            {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "timed out waiting for {:?} in output {:?}",
                        String::from_utf8_lossy(needle),
                        String::from_utf8_lossy(&self.screen)
                    )
                })
                .expect("stream ended");
            match event {
                Event::Data(data) => self.screen.extend_from_slice(&data),
                Event::Message(_, _) => {}
                Event::Eof => panic!("EOF while waiting for output"),
            }
        }
    }

    /// Wait for the server to close our connection.
    pub async fn wait_for_eof(&mut self) {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.events.recv())
                .await
                .expect("timed out waiting for EOF")
            {
                Some(Event::Eof) | None => return,
                Some(Event::Data(data)) => self.screen.extend_from_slice(&data),
                Some(Event::Message(_, _)) => {}
            }
        }
    }
}
