//! The shell host: owns the PTY and the login-shell child, fans output
//! to attached clients, and arbitrates their input.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::libc;
use nix::pty::{openpty, OpenptyResult};
use nix::unistd::{self, ForkResult, Pid};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tether_config::Config;
use tether_protocol::{MessageKind, ALT_ENTER, ALT_EXIT, CLEAR};
use tether_session::Session;

use crate::client::Attachment;
use crate::forward;
use crate::screen::EscapeBuffer;

/// PTY read chunk size.
const READ_CHUNK: usize = 8192;

/// Pick the login shell: the configured override, else the first
/// existing of the traditional candidates.
pub fn login_shell(config: &Config) -> eyre::Result<String> {
    if let Some(shell) = &config.shell {
        return Ok(shell.clone());
    }
    for candidate in ["/usr/bin/ksh", "/bin/ksh", "/bin/sh"] {
        if Path::new(candidate).exists() {
            return Ok(candidate.to_string());
        }
    }
    eyre::bail!("no available shells")
}

struct ShellState {
    clients: Vec<Arc<Attachment>>,
    pids: HashMap<i32, Arc<Attachment>>,
    eb: EscapeBuffer,
    rows: u16,
    cols: u16,
    exiting: bool,
}

/// One running shell. Zero or more clients may be attached to it; the
/// shell mutex serializes everything they can observe.
pub struct Shell {
    session: Session,
    config: Config,
    state: Mutex<ShellState>,
    master: OnceLock<OwnedFd>,
    // One reactor registration shared by the output task (read side)
    // and input writers (write side).
    master_async: OnceLock<AsyncFd<BorrowedFd<'static>>>,
    // Serializes PTY writes so concurrent clients cannot tear each
    // other's input. Deliberately not the state mutex: a full PTY input
    // buffer must not stall the output fan-out.
    input_lock: tokio::sync::Mutex<()>,
    child: OnceLock<Pid>,
    done_tx: watch::Sender<Option<i32>>,
    done_rx: watch::Receiver<Option<i32>>,
}

impl Shell {
    /// A shell that has not been started yet. The screen buffer carries
    /// the standard alt-screen and erase tracking from the beginning.
    pub fn new(session: Session, config: &Config) -> Arc<Shell> {
        let (done_tx, done_rx) = watch::channel(None);
        Arc::new(Shell {
            session,
            config: config.clone(),
            state: Mutex::new(ShellState {
                clients: Vec::new(),
                pids: HashMap::new(),
                eb: EscapeBuffer::standard(config.scrollback_bytes),
                rows: 0,
                cols: 0,
                exiting: false,
            }),
            master: OnceLock::new(),
            master_async: OnceLock::new(),
            input_lock: tokio::sync::Mutex::new(()),
            child: OnceLock::new(),
            done_tx,
            done_rx,
        })
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolves once the shell child has exited, with its exit code.
    #[must_use]
    pub fn done(&self) -> watch::Receiver<Option<i32>> {
        self.done_rx.clone()
    }

    /// Open the PTY, fork the login shell onto its slave side, and start
    /// the output and wait tasks.
    pub fn start(self: &Arc<Self>) -> eyre::Result<()> {
        if self.master.get().is_some() {
            eyre::bail!("shell already started");
        }
        let shell_path = login_shell(&self.config)?;
        let base = Path::new(&shell_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sh");

        let mut env: Vec<(String, String)> = std::env::vars().collect();
        set_env(&mut env, "_PTY_NAME", self.session.name());
        set_env(&mut env, "_PTY_SHELL", "true");
        set_env(
            &mut env,
            "_PTY_SOCKET",
            &self.session.addr().unwrap_or_default(),
        );
        for name in &self.config.forward {
            let value = std::env::var(name).unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            let sock = self.session.path().join(format!("{name}.sock"));
            if let Err(e) = forward::spawn_forwarder(name, &sock) {
                eyre::bail!("forwarder[{name}]: {e}");
            }
            set_env(&mut env, name, &sock.display().to_string());
        }

        // Everything the child needs is built before the fork; only
        // async-signal-safe calls happen on the child side.
        let path_c = CString::new(shell_path.as_str())?;
        let argv = vec![CString::new(format!("-{base}"))?];
        let envp: Vec<CString> = env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<_, _>>()?;

        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| eyre::eyre!("openpty failed: {e}"))?;

        let child = match unsafe { unistd::fork() }.map_err(|e| eyre::eyre!("fork failed: {e}"))? {
            ForkResult::Child => {
                drop(master);
                let _ = unistd::setsid();
                let slave_raw = slave.as_raw_fd();
                unsafe {
                    libc::ioctl(slave_raw, libc::TIOCSCTTY as _, 0);
                    libc::dup2(slave_raw, libc::STDIN_FILENO);
                    libc::dup2(slave_raw, libc::STDOUT_FILENO);
                    libc::dup2(slave_raw, libc::STDERR_FILENO);
                }
                if slave_raw > 2 {
                    drop(slave);
                }
                let _ = unistd::execve(&path_c, &argv, &envp);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => child,
        };
        drop(slave);

        // Non-blocking master so the reader task can share the runtime.
        let master_raw = master.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(master_raw, libc::F_GETFL);
            libc::fcntl(master_raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        self.master
            .set(master)
            .map_err(|_| eyre::eyre!("shell already started"))?;
        let async_fd = AsyncFd::with_interest(
            unsafe { BorrowedFd::borrow_raw(master_raw) },
            Interest::READABLE | Interest::WRITABLE,
        )
        .map_err(|e| eyre::eyre!("watching pty: {e}"))?;
        self.master_async
            .set(async_fd)
            .map_err(|_| eyre::eyre!("shell already started"))?;
        self.child
            .set(child)
            .map_err(|_| eyre::eyre!("shell already started"))?;
        info!(
            "started {shell_path} (pid {child}) for session {}",
            self.session.name()
        );

        tokio::spawn(Arc::clone(self).run_output());
        tokio::spawn(Arc::clone(self).run_wait());
        Ok(())
    }

    fn master_fd(&self) -> Option<i32> {
        self.master.get().map(|fd| fd.as_raw_fd())
    }

    /// Read PTY output and fan it to the screen buffer and every
    /// attached client. Ends when the PTY errors out, which normally
    /// means the child is gone.
    async fn run_output(self: Arc<Self>) {
        let (Some(master_raw), Some(async_fd)) = (self.master_fd(), self.master_async.get())
        else {
            return;
        };
        // Give the shell a beat to settle its tty before clients attach.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buf = vec![0u8; READ_CHUNK];
        'outer: loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    debug!("pty readiness: {e}");
                    break;
                }
            };
            loop {
                let n = unsafe {
                    libc::read(master_raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n > 0 {
                    self.feed_output(&buf[..n as usize]);
                    continue;
                }
                if n == 0 {
                    break 'outer;
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    break;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // EIO is the usual end: the slave side is fully closed.
                debug!("pty read: {err}");
                break 'outer;
            }
        }
        self.close_all_clients().await;
    }

    /// Mirror a chunk of shell output into the screen buffer and fan an
    /// immutable copy to every attached client, under the shell mutex.
    pub(crate) fn feed_output(&self, chunk: &[u8]) {
        let st = &mut *self.state.lock();
        st.eb.write(chunk);
        for client in &st.clients {
            client.output(chunk);
        }
    }

    /// Reap the child and drive teardown with its exit code.
    async fn run_wait(self: Arc<Self>) {
        let Some(&child) = self.child.get() else {
            return;
        };
        let code = tokio::task::spawn_blocking(move || wait_for_child(child))
            .await
            .unwrap_or(1);
        info!("shell child exited with code {code}");
        self.exit(code).await;
    }

    /// Graceful teardown: close the clients, drop the rendezvous entry,
    /// and publish the exit code.
    pub async fn exit(&self, code: i32) {
        self.close_all_clients().await;
        self.session.remove();
        let _ = self.done_tx.send(Some(code));
    }

    async fn close_all_clients(&self) {
        let (clients, in_alt) = {
            let mut st = self.state.lock();
            if st.exiting {
                (Vec::new(), false)
            } else {
                st.exiting = true;
                st.pids.clear();
                (std::mem::take(&mut st.clients), st.eb.in_alt())
            }
        };
        for client in clients {
            if in_alt {
                client.output(ALT_EXIT);
            }
            client.close().await;
        }
    }

    /// Add a client: greet it, repaint the current screen, and start
    /// fanning output to it.
    pub fn attach(&self, client: &Arc<Attachment>) {
        let mut st = self.state.lock();
        if st.exiting {
            return;
        }
        client.send(MessageKind::Start, b"");
        let mut repaint = Vec::with_capacity(CLEAR.len() + st.eb.normal().len());
        repaint.extend_from_slice(CLEAR);
        repaint.extend_from_slice(st.eb.normal());
        client.output(&repaint);
        if st.eb.in_alt() {
            client.output(ALT_ENTER);
            client.output(st.eb.alt());
        }
        st.clients.push(Arc::clone(client));
        debug!("attached client ({} total)", st.clients.len());
    }

    /// Remove a client from the fan-out set. Queued output it never
    /// read is dropped with it.
    pub fn detach(&self, client: &Arc<Attachment>) {
        let mut st = self.state.lock();
        st.clients.retain(|c| !Arc::ptr_eq(c, client));
        st.pids.retain(|_, c| !Arc::ptr_eq(c, client));
    }

    /// Make `client` the primary: every other primary is preempted and
    /// told so, and `client` is told to re-forward its environment.
    pub fn take(&self, client: &Arc<Attachment>) {
        if client.is_primary() {
            return;
        }
        let st = self.state.lock();
        info!("client {} takes the session", client.name());
        for other in &st.clients {
            if Arc::ptr_eq(other, client) {
                continue;
            }
            if other.yield_primary() {
                other.send(MessageKind::Preempt, b"");
            }
        }
        client.make_primary();
        client.send(MessageKind::Primary, b"");
    }

    /// Record a client's identity from its `TtyName` message.
    pub fn register_identity(&self, client: &Arc<Attachment>, pid: i32, name: &str) {
        client.set_name(name);
        if pid != 0 {
            client.set_pid(pid);
            self.state.lock().pids.insert(pid, Arc::clone(client));
        } else {
            warn!("ttyname with no pid: {name}");
        }
    }

    /// Live client count: attachments that identified themselves and
    /// whose process still exists. Dead entries are swept as a side
    /// effect.
    pub fn count(&self) -> usize {
        let mut st = self.state.lock();
        let dead: Vec<i32> = st
            .pids
            .keys()
            .copied()
            .filter(|&pid| {
                nix::sys::signal::kill(Pid::from_raw(pid), None).is_err()
            })
            .collect();
        for pid in dead {
            if let Some(client) = st.pids.remove(&pid) {
                st.clients.retain(|c| !Arc::ptr_eq(c, &client));
            }
        }
        st.pids.len()
    }

    /// Sorted listing of attached client names, with the caller marked.
    #[must_use]
    pub fn list(&self, me: &Arc<Attachment>) -> String {
        let st = self.state.lock();
        let mut lines: Vec<String> = st
            .clients
            .iter()
            .map(|c| {
                let mut name = c.name();
                if Arc::ptr_eq(c, me) {
                    name.push_str(" *");
                }
                name
            })
            .collect();
        lines.sort();
        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push_str("\r\n");
        }
        out
    }

    /// Detach and close every client except `me`, each with a notice
    /// saying who kicked it.
    pub async fn exclusive(&self, me: &Arc<Attachment>) {
        let (others, my_name) = {
            let mut st = self.state.lock();
            let others: Vec<Arc<Attachment>> = st
                .clients
                .iter()
                .filter(|c| !Arc::ptr_eq(c, me))
                .cloned()
                .collect();
            st.clients.retain(|c| Arc::ptr_eq(c, me));
            st.pids.retain(|_, c| Arc::ptr_eq(c, me));
            (others, me.name())
        };
        for other in others {
            other.send(
                MessageKind::Server,
                format!("\r\nDetached by client {my_name}\r\n").as_bytes(),
            );
            other.close().await;
        }
    }

    /// Write client keystrokes to the PTY. A dedicated lock keeps
    /// concurrent clients from tearing each other's input; when the PTY
    /// input buffer is full the task parks on writability instead of
    /// spinning, so output fan-out keeps flowing to everyone else.
    pub async fn write_input(&self, data: &[u8]) -> io::Result<()> {
        let (Some(fd), Some(async_fd)) = (self.master_fd(), self.master_async.get()) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no pty"));
        };
        let _guard = self.input_lock.lock().await;
        let mut off = 0;
        while off < data.len() {
            let mut guard = async_fd.writable().await?;
            let n = unsafe {
                libc::write(
                    fd,
                    data[off..].as_ptr() as *const libc::c_void,
                    data.len() - off,
                )
            };
            if n >= 0 {
                off += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => guard.clear_ready(),
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Apply a tty-size update; a repeat of the current geometry is a
    /// no-op without touching the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        {
            let mut st = self.state.lock();
            if st.rows == rows && st.cols == cols {
                return Ok(());
            }
            st.rows = rows;
            st.cols = cols;
        }
        let Some(fd) = self.master_fd() else {
            return Ok(());
        };
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        let st = self.state.lock();
        (st.rows, st.cols)
    }

    /// Write the active screen buffer to `path`, mode 0600.
    pub fn save(&self, path: &str) -> io::Result<()> {
        let data = {
            let st = self.state.lock();
            st.eb.active().to_vec()
        };
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        io::Write::write_all(&mut file, &data)
    }

    /// Human-readable listing of the escape sequences present in the
    /// chosen screen buffer.
    #[must_use]
    pub fn escapes(&self, alt: bool) -> String {
        let st = self.state.lock();
        let buf = if alt { st.eb.alt() } else { st.eb.normal() };
        crate::escapes::describe(buf)
    }

    /// State snapshot for the `Dump` diagnostic.
    #[must_use]
    pub fn dump(&self) -> String {
        let st = self.state.lock();
        let mut out = format!(
            "session {} rows={} cols={} in_alt={} exiting={}\n",
            self.session.name(),
            st.rows,
            st.cols,
            st.eb.in_alt(),
            st.exiting,
        );
        out.push_str(&format!(
            "buffers normal={}B alt={}B\n",
            st.eb.normal().len(),
            st.eb.alt().len()
        ));
        for client in &st.clients {
            out.push_str("client ");
            out.push_str(&client.describe());
            out.push('\n');
        }
        out
    }
}

fn set_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    for pair in env.iter_mut() {
        if pair.0 == key {
            pair.1 = value.to_string();
            return;
        }
    }
    env.push((key.to_string(), value.to_string()));
}

fn wait_for_child(child: Pid) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AttachmentWriter;
    use tether_protocol::{MessageReader, MessageWriter};
    use tokio::io::{AsyncWrite, DuplexStream};

    fn test_shell() -> Arc<Shell> {
        let root = tempfile::tempdir().unwrap();
        let session = Session::create(root.path(), "shelltest").unwrap();
        // The tempdir is dropped here; these tests never touch the
        // session directory.
        Shell::new(session, &Config::default())
    }

    fn test_attachment() -> (Arc<Attachment>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024 * 1024);
        let writer: Arc<AttachmentWriter> = Arc::new(MessageWriter::new(
            Box::new(ours) as Box<dyn AsyncWrite + Send + Unpin>
        ));
        (Attachment::new(writer), theirs)
    }

    #[tokio::test]
    async fn keystroke_take_keeps_a_single_primary() {
        let shell = test_shell();
        let (x, _xs) = test_attachment();
        let (y, _ys) = test_attachment();
        shell.attach(&x);
        shell.attach(&y);

        shell.take(&x);
        assert!(x.is_primary());
        assert!(!y.is_primary());

        shell.take(&y);
        assert!(y.is_primary());
        assert!(!x.is_primary());

        // Taking again is a no-op.
        shell.take(&y);
        assert!(y.is_primary());
        assert!(!x.is_primary());
    }

    #[tokio::test]
    async fn exclusive_leaves_only_the_caller() {
        let shell = test_shell();
        let (a, _streams_a) = test_attachment();
        let (b, _streams_b) = test_attachment();
        let (c, _streams_c) = test_attachment();
        shell.attach(&a);
        shell.attach(&b);
        shell.attach(&c);
        shell.register_identity(&a, std::process::id() as i32, "pts/0");

        shell.exclusive(&a).await;

        let listing = shell.list(&a);
        assert_eq!(listing, "pts/0 *\r\n");
        assert_eq!(shell.count(), 1);
    }

    #[tokio::test]
    async fn count_sweeps_dead_and_unidentified_clients() {
        let shell = test_shell();
        let (p1, _s1) = test_attachment();
        let (p2, _s2) = test_attachment();
        let (p3, _s3) = test_attachment();
        let (p4, _s4) = test_attachment();
        shell.attach(&p1);
        shell.attach(&p2);
        shell.attach(&p3);
        shell.attach(&p4);

        let me = std::process::id() as i32;
        let parent = unistd::getppid().as_raw();
        shell.register_identity(&p1, me, "pts/1");
        shell.register_identity(&p2, 999_999_999, "pts/2");
        shell.register_identity(&p3, parent, "pts/3");
        // p4 never identifies itself: information-only, never counted.

        assert_eq!(shell.count(), 2);
        // The dead client was swept out of the attached set too.
        let listing = shell.list(&p1);
        assert!(!listing.contains("pts/2"));
    }

    #[tokio::test]
    async fn list_is_sorted_and_marks_the_caller() {
        let shell = test_shell();
        let (a, _sa) = test_attachment();
        let (b, _sb) = test_attachment();
        shell.attach(&a);
        shell.attach(&b);
        a.set_name("zeta");
        b.set_name("alpha");
        assert_eq!(shell.list(&a), "alpha\r\nzeta *\r\n");
    }

    #[tokio::test]
    async fn attach_repaints_current_screen_state() {
        let shell = test_shell();
        shell.feed_output(b"hello\x1b[?1049h\x1b[2Jalt");

        let (late, theirs) = test_attachment();
        shell.attach(&late);
        late.close().await;

        let messages = std::cell::RefCell::new(Vec::new());
        let mut reader = MessageReader::new(theirs, |kind, payload: &[u8]| {
            messages.borrow_mut().push((kind, payload.to_vec()));
        });
        let mut data = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) => panic!("reading repaint: {e}"),
            }
        }

        // Greeting first, then clear + normal, alt-enter, rewritten alt.
        assert_eq!(
            *messages.borrow(),
            vec![(MessageKind::Start as u8, Vec::new())]
        );
        let expected = [
            CLEAR,
            b"hello".as_slice(),
            ALT_ENTER,
            b"\x1b[H\x1b[2Jalt".as_slice(),
        ]
        .concat();
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn resize_deduplicates_identical_geometry() {
        let shell = test_shell();
        // No PTY: the update must still be recorded, and the repeat must
        // short-circuit before touching the (absent) master.
        shell.resize(40, 80).unwrap();
        assert_eq!(shell.size(), (40, 80));
        shell.resize(40, 80).unwrap();
        assert_eq!(shell.size(), (40, 80));
        shell.resize(50, 132).unwrap();
        assert_eq!(shell.size(), (50, 132));
    }
}
