//! On-disk session rendezvous and discovery.
//!
//! Each session lives in `~/.tether/@<name>/` as a handful of single-value
//! text files (`pid`, `addr`, `title`, `ttysize`) plus a `log/` directory.
//! A server writes `addr` and `pid` when it starts listening; clients poll
//! `addr` to dial. A session whose process is gone, or whose address no
//! longer accepts connections, is garbage and is removed by the next
//! observer that notices.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_protocol::{MessageKind, MessageReader, MessageWriter};

/// How long `dial` waits for the server's address file to appear.
const DIAL_DEADLINE: Duration = Duration::from_secs(5);
const DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a probe round trip may take before the session is declared
/// unresponsive.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const VALID_BYTES: &str =
    "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-.+!=:[]<>{}";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid session name {0:?}")]
    InvalidName(String),
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' timed out")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns true if `name` may be used as a session name.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name == "log" {
        return false;
    }
    name.chars().all(|c| VALID_BYTES.contains(c))
}

/// The default rendezvous root: `~/.tether`.
#[must_use]
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// A (possibly not yet created) session. Servers call [`listen`],
/// clients call [`dial`]; both sides read and write the same files.
///
/// [`listen`]: Session::listen
/// [`dial`]: Session::dial
#[derive(Debug, Clone)]
pub struct Session {
    name: String,
    path: PathBuf,
    client_count: Option<usize>,
}

impl Session {
    /// Construct the handle and create the session directory (mode 0700)
    /// with its `log/` subdirectory.
    pub fn create(root: &Path, name: &str) -> Result<Session> {
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        let path = root.join(format!("@{name}"));
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(&path)?;
        builder.create(path.join("log"))?;
        Ok(Session {
            name: name.to_string(),
            path,
            client_count: None,
        })
    }

    /// A handle for a session directory that already exists (or is about
    /// to be checked). Does not touch the filesystem.
    pub fn open(root: &Path, name: &str) -> Result<Session> {
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(Session {
            name: name.to_string(),
            path: root.join(format!("@{name}")),
            client_count: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.path.join("log")
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// The live client count recorded by the last successful [`check`].
    ///
    /// [`check`]: Session::check
    #[must_use]
    pub fn client_count(&self) -> Option<usize> {
        self.client_count
    }

    /// Delete the whole session directory.
    pub fn remove(&self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("removing session {}: {e}", self.name);
            }
        }
    }

    fn read_file(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.path.join(name))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string())
    }

    fn write_file(&self, name: &str, data: &str) -> io::Result<()> {
        let path = self.path.join(name);
        fs::write(&path, data)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
    }

    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        self.read_file("pid")?.parse().ok()
    }

    #[must_use]
    pub fn addr(&self) -> Option<String> {
        self.read_file("addr")
    }

    #[must_use]
    pub fn title(&self) -> String {
        self.read_file("title").unwrap_or_default()
    }

    pub fn set_title(&self, title: &str) -> io::Result<()> {
        self.write_file("title", title)
    }

    /// Last known terminal geometry, as recorded by the primary client.
    #[must_use]
    pub fn ttysize(&self) -> String {
        self.read_file("ttysize").unwrap_or_default()
    }

    pub fn set_ttysize(&self, rows: u16, cols: u16) -> io::Result<()> {
        self.write_file("ttysize", &format!("({cols}x{rows})"))
    }

    /// Bind a loopback listener and publish its address and our pid. On a
    /// failed write the partial state is rolled back and the listener
    /// dropped.
    pub async fn listen(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        if let Err(e) = self.write_file("addr", &addr.to_string()) {
            self.remove();
            return Err(e.into());
        }
        if let Err(e) = self.write_file("pid", &std::process::id().to_string()) {
            self.remove();
            return Err(e.into());
        }
        info!("session {} listening on {addr}", self.name);
        Ok(listener)
    }

    /// Connect to the session's server, waiting up to five seconds for
    /// its address to be published.
    pub async fn dial(&self) -> Result<TcpStream> {
        let start = Instant::now();
        let addr = loop {
            if let Some(addr) = self.addr() {
                break addr;
            }
            if start.elapsed() > DIAL_DEADLINE {
                return Err(Error::NotFound(self.name.clone()));
            }
            tokio::time::sleep(DIAL_INTERVAL).await;
        };
        debug!("dialing {} @ {addr}", self.name);
        Ok(TcpStream::connect(&addr).await?)
    }

    /// True if the recorded server process exists.
    #[must_use]
    pub fn ping(&self) -> bool {
        let Some(pid) = self.pid() else {
            return false;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    /// One-shot request/response round trip against the session's server.
    /// The request is re-sent when the server's `Start` greeting arrives,
    /// so it is never lost to connection setup. A refused dial removes
    /// the session directory.
    pub async fn probe(&self, req: MessageKind, resp: MessageKind) -> Result<String> {
        let stream = match self.dial().await {
            Ok(s) => s,
            Err(e) => {
                debug!("dialing {}: {e}", self.name);
                self.remove();
                return Err(e);
            }
        };
        let (read_half, write_half) = stream.into_split();
        let writer = MessageWriter::new(write_half);
        writer.send(req, b"").await?;

        let events = std::sync::Mutex::new(Vec::new());
        let mut reader = MessageReader::new(read_half, |kind, payload: &[u8]| {
            events.lock().unwrap().push((kind, payload.to_vec()));
        });

        let deadline = Instant::now() + PROBE_TIMEOUT;
        let mut buf = [0u8; 256];
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Err(Error::Timeout(self.name.clone()));
            }
            match tokio::time::timeout(wait, reader.read(&mut buf)).await {
                Err(_) => return Err(Error::Timeout(self.name.clone())),
                Ok(Ok(0)) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed during probe",
                    )))
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
            let batch: Vec<(u8, Vec<u8>)> = events.lock().unwrap().drain(..).collect();
            for (kind, payload) in batch {
                if kind == MessageKind::Start as u8 {
                    writer.send(req, b"").await?;
                } else if kind == resp as u8 {
                    return Ok(String::from_utf8_lossy(&payload).into_owned());
                }
            }
        }
    }

    /// Liveness: the server process exists and answers a count probe.
    /// On success the reported client count is cached on this handle.
    pub async fn check(&mut self) -> bool {
        if !self.ping() {
            return false;
        }
        let reply = match self.probe(MessageKind::AskCount, MessageKind::Count).await {
            Ok(reply) => reply,
            Err(_) => return false,
        };
        // Accept both "<n>" and the legacy "<n>:<pid>" form.
        let digits = reply.split(':').next().unwrap_or("");
        match digits.trim().parse::<usize>() {
            Ok(n) => {
                self.client_count = Some(n);
                true
            }
            Err(_) => false,
        }
    }
}

/// Enumerate live sessions under `root`, pruning dead ones as they are
/// discovered. Results are sorted by name.
pub async fn sessions(root: &Path) -> Vec<Session> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return found,
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(|n| n.strip_prefix('@')) else {
            continue;
        };
        let Ok(mut session) = Session::open(root, name) else {
            continue;
        };
        if session.check().await {
            found.push(session);
        } else {
            debug!("pruning dead session {name}");
            session.remove();
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(is_valid_name("work"));
        assert!(is_valid_name("a-b.c_d+e=f:[]<>{}"));
        assert!(is_valid_name("A1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("log"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("slash/name"));
        assert!(!is_valid_name("new\nline"));
    }

    #[test]
    fn create_makes_directories() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        assert!(session.path().is_dir());
        assert!(session.log_dir().is_dir());
        let mode = fs::metadata(session.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn create_rejects_bad_names() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            Session::create(root.path(), "log"),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            Session::create(root.path(), "../evil"),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn title_and_ttysize_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        assert_eq!(session.title(), "");
        session.set_title("builds").unwrap();
        assert_eq!(session.title(), "builds");
        session.set_ttysize(40, 80).unwrap();
        assert_eq!(session.ttysize(), "(80x40)");
        let mode = fs::metadata(session.path().join("title"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn listen_publishes_addr_and_pid() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        let listener = session.listen().await.unwrap();
        let addr = session.addr().unwrap();
        assert_eq!(addr, listener.local_addr().unwrap().to_string());
        assert_eq!(session.pid(), Some(std::process::id() as i32));

        // A dial against the published address connects immediately.
        let (dialed, accepted) = tokio::join!(session.dial(), listener.accept());
        dialed.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn dial_times_out_without_addr() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        tokio::time::pause();
        let err = session.dial().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn ping_tracks_process_liveness() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        assert!(!session.ping(), "no pid file yet");

        session.write_file("pid", &std::process::id().to_string()).unwrap();
        assert!(session.ping());

        session.write_file("pid", "999999999").unwrap();
        assert!(!session.ping());
    }

    #[tokio::test]
    async fn dead_sessions_are_pruned_from_discovery() {
        let root = tempfile::tempdir().unwrap();
        let dead = Session::create(root.path(), "dead").unwrap();
        dead.write_file("pid", "999999999").unwrap();
        dead.write_file("addr", "127.0.0.1:1").unwrap();

        let live = sessions(root.path()).await;
        assert!(live.is_empty());
        assert!(!dead.exists(), "dead session directory should be removed");
    }

    #[tokio::test]
    async fn check_fails_for_listener_without_server() {
        // A pid that exists but never answers the count probe: check()
        // must come back false once the probe times out or EOFs.
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "demo").unwrap();
        let listener = session.listen().await.unwrap();
        let mut probe_target = session.clone();

        let accept = tokio::spawn(async move {
            // Accept and immediately drop the connection.
            let _ = listener.accept().await;
        });
        assert!(!probe_target.check().await);
        accept.await.unwrap();
    }
}
