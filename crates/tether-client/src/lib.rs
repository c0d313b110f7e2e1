//! Attach runtime: the interactive client side of a tether session.
//!
//! Dials the session, puts the controlling terminal into raw mode, and
//! runs two loops: server output to stdout (scanning for the agent
//! re-forward marker) and keyboard to server (scanning for the escape
//! character). Control messages ride the same stream and are dispatched
//! as they arrive.

mod command;

pub use command::split_line;

use std::collections::HashMap;
use std::io::{self, Write as _};
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::libc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use tether_config::Config;
use tether_protocol::{encode_size, MessageKind, MessageReader, MessageWriter, SEND_SSH};
use tether_session::Session;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("session error: {0}")]
    Session(#[from] tether_session::Error),
    #[error("ping timed out")]
    PingTimeout,
    #[error("ps timed out")]
    PsTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;

const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AttachOptions {
    /// Escape character for keyboard commands; `None` disables it.
    pub escape: Option<u8>,
    /// Suppress the greeting when we just spawned this session.
    pub just_started: bool,
}

/// Mirror-to-file sink for everything the server sends to the screen.
pub struct Tee {
    inner: StdMutex<Option<(String, std::fs::File)>>,
}

impl Tee {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(None),
        }
    }

    fn write(&self, buf: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((path, file)) = inner.as_mut() {
            if let Err(e) = file.write_all(buf) {
                eprintln!("ERROR WRITING TEE {path}: {e}\r");
            }
        }
    }

    pub fn open(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if path == "-" {
            *inner = None;
            return;
        }
        if let Some((existing, _)) = inner.as_ref() {
            println!("ERROR: already teeing to {existing}\r");
            return;
        }
        match std::fs::File::create(path) {
            Ok(file) => *inner = Some((path.to_string(), file)),
            Err(e) => println!("ERROR OPENING TEE: {e}\r"),
        }
    }
}

/// Shared client-side state: the writer plus the rendezvous points for
/// request/response round trips.
pub(crate) struct Runtime {
    pub session: Session,
    pub config: Config,
    pub writer: Arc<MessageWriter<OwnedWriteHalf>>,
    pub tee: Arc<Tee>,
    ackers: Arc<StdMutex<HashMap<[u8; 16], oneshot::Sender<()>>>>,
    ps_pending: Arc<StdMutex<Option<oneshot::Sender<Vec<u8>>>>>,
}

impl Runtime {
    /// Round-trip a random nonce through the server.
    pub async fn ping(&self) -> Result<()> {
        let nonce: [u8; 16] = rand::random();
        let (tx, rx) = oneshot::channel();
        self.ackers.lock().unwrap().insert(nonce, tx);
        self.writer
            .send(MessageKind::Ping, &nonce)
            .await
            .map_err(Error::Io)?;
        match tokio::time::timeout(ROUND_TRIP_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.ackers.lock().unwrap().remove(&nonce);
                Err(Error::PingTimeout)
            }
        }
    }

    /// Fetch the server-side process summary.
    pub async fn ps(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self.ps_pending.lock().unwrap() = Some(tx);
        self.writer
            .send(MessageKind::Ps, b"")
            .await
            .map_err(Error::Io)?;
        match tokio::time::timeout(ROUND_TRIP_TIMEOUT, rx).await {
            Ok(Ok(data)) => Ok(data),
            _ => {
                self.ps_pending.lock().unwrap().take();
                Err(Error::PsTimeout)
            }
        }
    }

    /// Re-send the forward target for every configured variable set in
    /// our environment. Called when we become primary and on the ssh
    /// marker.
    pub async fn send_forwards(&self) {
        for name in &self.config.forward {
            let value = std::env::var(name).unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            let payload = [name.as_bytes(), b"\0".as_slice(), value.as_bytes()].concat();
            if let Err(e) = self.writer.send(MessageKind::Forward, &payload).await {
                debug!("forward {name}: {e}");
            }
        }
    }

    /// Send our terminal geometry, remembering it in the session dir.
    pub async fn send_ttysize(&self) {
        let Some((rows, cols)) = stdin_window_size() else {
            return;
        };
        if let Err(e) = self
            .writer
            .send(MessageKind::TtySize, &encode_size(rows, cols))
            .await
        {
            debug!("ttysize: {e}");
        }
        if let Err(e) = self.session.set_ttysize(rows, cols) {
            debug!("recording ttysize: {e}");
        }
    }
}

/// Attach to the session and run until detach or server exit. Returns
/// the process exit code.
pub async fn attach(session: Session, config: Config, opts: AttachOptions) -> Result<i32> {
    let stream = session.dial().await?;
    display_motd(&session).await;

    let raw = RawGuard::new();
    if !opts.just_started {
        print!("Connected to session {}\r\n", session.name());
    }
    if let Some(escape) = opts.escape {
        print!(
            "Escape character is {}\r\n",
            tether_config::print_escape_char(escape)
        );
    }
    let _ = io::stdout().flush();

    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(MessageWriter::new(write_half));
    let runtime = Arc::new(Runtime {
        session,
        config,
        writer,
        tee: Arc::new(Tee::new()),
        ackers: Arc::new(StdMutex::new(HashMap::new())),
        ps_pending: Arc::new(StdMutex::new(None)),
    });

    let (ready_tx, mut ready_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = watch::channel(false);
    tokio::spawn(run_server_reader(
        read_half,
        Arc::clone(&runtime),
        ready_tx,
        done_tx,
    ));

    // Initial geometry, then follow SIGWINCH for the rest of the run.
    runtime.send_ttysize().await;
    tokio::spawn(watch_sigwinch(Arc::clone(&runtime)));

    let tty = nix::unistd::ttyname(unsafe { BorrowedFd::borrow_raw(0) })
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    runtime
        .writer
        .send(
            MessageKind::TtyName,
            format!("{}:{}", std::process::id(), tty).as_bytes(),
        )
        .await
        .map_err(Error::Io)?;

    // Hold keyboard input until the server has greeted us.
    while !*ready_rx.borrow() {
        if ready_rx.changed().await.is_err() {
            break;
        }
    }

    let code = keyboard_loop(&runtime, opts.escape, &raw, &mut done_rx).await?;
    drop(raw);
    Ok(code)
}

/// Keyboard to server, watching for the escape character. Returns the
/// exit code once the user detaches or the server goes away.
async fn keyboard_loop(
    runtime: &Arc<Runtime>,
    escape: Option<u8>,
    raw: &RawGuard,
    done_rx: &mut watch::Receiver<bool>,
) -> Result<i32> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 32 * 1024];
    // 0 = passthrough, 1 = escape seen; survives chunk boundaries.
    let mut state = 0u8;
    let mut consecutive_errors = 0u32;

    loop {
        let read = tokio::select! {
            read = stdin.read(&mut buf) => read,
            changed = done_rx.changed() => {
                // Server side went away: we are done.
                let _ = changed;
                return Ok(0);
            }
        };
        let mut n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!("reading stdin: {e}");
                consecutive_errors += 1;
                if consecutive_errors > 10 {
                    return Err(e.into());
                }
                continue;
            }
        };
        if n == 0 {
            return Ok(0);
        }
        consecutive_errors = 0;

        let mut cmd = 0u8;
        if let Some(tilde) = escape {
            'scan: for &byte in &buf[..n] {
                match state {
                    0 => {
                        if byte == tilde {
                            state = 1;
                        }
                    }
                    _ => match byte {
                        b'.' | b':' => {
                            cmd = byte;
                            state = 2;
                            break 'scan;
                        }
                        b if b == tilde => {
                            // Doubled escape: pass one through literally.
                            n = 0;
                            state = 0;
                            runtime.writer.write(&[tilde]).await.map_err(Error::Io)?;
                            break 'scan;
                        }
                        _ => state = 0,
                    },
                }
            }
            if state >= 1 {
                n = n.saturating_sub(state as usize);
            }
        }

        if n > 0 {
            runtime.writer.write(&buf[..n]).await.map_err(Error::Io)?;
        }

        match cmd {
            0 => continue,
            b'.' => {
                print!("\r\n");
                let _ = io::stdout().flush();
                return Ok(0);
            }
            b':' => {
                raw.make_cooked();
                print!("\nCommand: ");
                let _ = io::stdout().flush();
                let line = read_line(&mut stdin).await?;
                match split_line(&line) {
                    Ok(args) => {
                        command::run(false, runtime, &args).await;
                        raw.make_raw();
                        command::run(true, runtime, &args).await;
                    }
                    Err(e) => {
                        println!("{e}");
                        raw.make_raw();
                    }
                }
            }
            _ => {}
        }
        state = 0;
    }
}

/// Server to stdout. Frames are dispatched in arrival order; the data
/// stream is scanned for the agent re-forward marker.
async fn run_server_reader(
    read_half: OwnedReadHalf,
    runtime: Arc<Runtime>,
    ready_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
) {
    enum Event {
        Data(Vec<u8>),
        Message(u8, Vec<u8>),
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let message_tx = tx.clone();
    let pump = tokio::spawn(async move {
        let mut reader = MessageReader::new(read_half, move |kind, payload: &[u8]| {
            let _ = message_tx.send(Event::Message(kind, payload.to_vec()));
        });
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Event::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("read from server: {e}");
                    break;
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            Event::Data(data) => {
                // The marker is assumed to arrive within one chunk.
                let mut rest: &[u8] = &data;
                if let Some(x) = find(rest, SEND_SSH) {
                    write_screen(&mut stdout, &runtime, &rest[..x]).await;
                    runtime.send_forwards().await;
                    rest = &rest[x + SEND_SSH.len()..];
                }
                write_screen(&mut stdout, &runtime, rest).await;
            }
            Event::Message(kind, payload) => {
                dispatch(&runtime, &ready_tx, &mut stdout, kind, &payload).await;
            }
        }
    }
    let _ = pump.await;
    let _ = done_tx.send(true);
}

async fn write_screen(stdout: &mut tokio::io::Stdout, runtime: &Runtime, buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    if let Err(e) = stdout.write_all(buf).await {
        warn!("writing to stdout: {e}");
        return;
    }
    let _ = stdout.flush().await;
    runtime.tee.write(buf);
}

/// Handle one control message from the server.
async fn dispatch(
    runtime: &Arc<Runtime>,
    ready_tx: &watch::Sender<bool>,
    stdout: &mut tokio::io::Stdout,
    kind: u8,
    payload: &[u8],
) {
    match MessageKind::from_wire(kind) {
        Some(MessageKind::Ping) => {
            if let Err(e) = runtime.writer.send(MessageKind::Ack, payload).await {
                debug!("ack: {e}");
            }
        }
        Some(MessageKind::Ack) => {
            let mut key = [0u8; 16];
            let n = payload.len().min(16);
            key[..n].copy_from_slice(&payload[..n]);
            if let Some(waiter) = runtime.ackers.lock().unwrap().remove(&key) {
                let _ = waiter.send(());
            }
        }
        Some(MessageKind::Ps) => {
            if let Some(waiter) = runtime.ps_pending.lock().unwrap().take() {
                let _ = waiter.send(payload.to_vec());
            }
        }
        Some(MessageKind::Server) => {
            write_screen(stdout, runtime, payload).await;
        }
        Some(MessageKind::Start) => {
            let _ = ready_tx.send(true);
        }
        Some(MessageKind::Primary) => {
            // We are primary now: re-assert geometry and forwarders.
            runtime.send_ttysize().await;
            runtime.send_forwards().await;
        }
        Some(MessageKind::Preempt) => {
            debug!("preempted by another client");
        }
        Some(MessageKind::Count) | Some(MessageKind::Wait) => {}
        _ => {
            print!("Got message type {kind}: {payload:?}\r\n");
            let _ = io::stdout().flush();
        }
    }
}

async fn watch_sigwinch(runtime: Arc<Runtime>) {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        runtime.send_ttysize().await;
    }
}

/// Show `~/.tether/motd` once, waiting for ENTER, the way login systems
/// do. Quietly does nothing when the file is absent.
async fn display_motd(session: &Session) {
    let Some(root) = session.path().parent() else {
        return;
    };
    let Ok(motd) = std::fs::read(root.join("motd")) else {
        return;
    };
    let _ = io::stdout().write_all(&motd);
    print!("Press ENTER to continue: ");
    let _ = io::stdout().flush();
    let mut stdin = tokio::io::stdin();
    let mut byte = [0u8; 1];
    loop {
        match stdin.read(&mut byte).await {
            Ok(0) => return,
            Ok(_) if byte[0] == b'\n' || byte[0] == b'\r' => return,
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

async fn read_line(stdin: &mut tokio::io::Stdin) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stdin.read(&mut byte).await?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[must_use]
fn stdin_window_size() -> Option<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 {
        return None;
    }
    Some((ws.ws_row, ws.ws_col))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Raw-mode guard for the controlling terminal. Pipes are left alone.
/// Restores the saved state on drop as a backstop.
pub struct RawGuard {
    saved: StdMutex<Option<nix::sys::termios::Termios>>,
}

impl RawGuard {
    #[must_use]
    pub fn new() -> Self {
        let guard = Self {
            saved: StdMutex::new(None),
        };
        guard.make_raw();
        guard
    }

    pub fn make_raw(&self) {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        let fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        let Ok(orig) = tcgetattr(fd) else {
            return;
        };
        let mut raw = orig.clone();
        cfmakeraw(&mut raw);
        if tcsetattr(fd, SetArg::TCSANOW, &raw).is_ok() {
            let mut saved = self.saved.lock().unwrap();
            if saved.is_none() {
                *saved = Some(orig);
            }
        }
    }

    pub fn make_cooked(&self) {
        use nix::sys::termios::{tcsetattr, SetArg};
        let fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        if let Some(orig) = self.saved.lock().unwrap().take() {
            let _ = tcsetattr(fd, SetArg::TCSANOW, &orig);
        }
    }
}

impl Default for RawGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        self.make_cooked();
    }
}
