//! The tether session server.
//!
//! One server process hosts one login shell on a PTY and accepts any
//! number of client attachments over loopback TCP. Shell output fans out
//! to every attachment; input is arbitrated so the most recently active
//! client is the primary one.

mod client;
mod escapes;
mod forward;
mod procinfo;
mod screen;
mod shell;

pub use shell::{login_shell, Shell};

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tether_config::Config;
use tether_protocol::{decode_size, MessageKind, MessageReader, MessageWriter};
use tether_session::Session;

use client::{Attachment, AttachmentWriter};

/// Run a session server to completion. Returns the shell's exit code.
///
/// The caller has already decided the session name; this creates the
/// rendezvous entry, starts the shell, and serves attachments until the
/// shell child exits.
pub async fn run(root: &Path, name: &str, config: Config) -> eyre::Result<i32> {
    if std::env::var("_PTY_SHELL").is_ok() {
        eyre::bail!("cannot run tether within a shell spawned by tether");
    }

    let session = Session::create(root, name)?;
    let listener = session.listen().await?;
    let shell = Shell::new(session, &config);
    shell.start()?;
    tokio::spawn(watch_signals(Arc::clone(&shell)));

    let mut done = shell.done();
    loop {
        if let Some(code) = *done.borrow_and_update() {
            return Ok(code);
        }
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        tokio::spawn(handle_connection(Arc::clone(&shell), stream));
                    }
                    Err(e) => warn!("accept: {e}"),
                }
            }
            changed = done.changed() => {
                if changed.is_err() {
                    return Ok(1);
                }
            }
        }
    }
}

/// SIGTERM tears the session down; SIGQUIT dumps server state to the
/// log and keeps running; the crash signals (SIGABRT, SIGBUS, SIGSEGV)
/// dump state and then exit, so a dying server leaves a diagnostic
/// behind.
async fn watch_signals(shell: Arc<Shell>) {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut term), Ok(mut quit), Ok(mut abrt), Ok(mut bus), Ok(mut segv)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
        signal(SignalKind::from_raw(nix::libc::SIGABRT)),
        signal(SignalKind::from_raw(nix::libc::SIGBUS)),
        signal(SignalKind::from_raw(nix::libc::SIGSEGV)),
    ) else {
        warn!("signal handlers unavailable");
        return;
    };
    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("SIGTERM: shutting down");
                shell.exit(143).await;
                return;
            }
            _ = quit.recv() => {
                info!("state dump on SIGQUIT:\n{}", shell.dump());
            }
            _ = abrt.recv() => return crash_exit(&shell, "SIGABRT", 134).await,
            _ = bus.recv() => return crash_exit(&shell, "SIGBUS", 135).await,
            _ = segv.recv() => return crash_exit(&shell, "SIGSEGV", 139).await,
        }
    }
}

async fn crash_exit(shell: &Shell, name: &str, code: i32) {
    error!("state dump on {name}:\n{}", shell.dump());
    shell.exit(code).await;
}

enum Event {
    /// Opaque keystroke bytes for the PTY.
    Data(Vec<u8>),
    /// A framed control message.
    Message(u8, Vec<u8>),
}

/// Serve one attachment: deframe its stream, apply its messages to the
/// shell in arrival order, and forward its keystrokes to the PTY.
async fn handle_connection(shell: Arc<Shell>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let writer: Arc<AttachmentWriter> = Arc::new(MessageWriter::new(
        Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>,
    ));
    let client = Attachment::new(Arc::clone(&writer));
    shell.attach(&client);

    // The reader pump feeds one ordered queue so control messages and
    // keystrokes are applied in exactly the order they arrived, even
    // though message callbacks fire from inside the codec read.
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let message_tx = tx.clone();
    let pump = tokio::spawn(async move {
        let mut reader = MessageReader::new(read_half, move |kind, payload: &[u8]| {
            let _ = message_tx.send(Event::Message(kind, payload.to_vec()));
        });
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Event::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("read from client: {e}");
                    break;
                }
            }
        }
    });

    while let Some(event) = rx.recv().await {
        match event {
            Event::Data(data) => {
                // Any keystroke makes this client primary.
                shell.take(&client);
                if let Err(e) = shell.write_input(&data).await {
                    warn!("write to shell: {e}");
                    break;
                }
            }
            Event::Message(kind, payload) => {
                dispatch(&shell, &client, &writer, kind, &payload).await;
            }
        }
    }

    pump.abort();
    shell.detach(&client);
    client.close().await;
    debug!("client disconnected");
}

/// Apply one control message. Malformed input earns the sender an
/// informational reply, never a teardown.
async fn dispatch(
    shell: &Arc<Shell>,
    client: &Arc<Attachment>,
    writer: &Arc<AttachmentWriter>,
    kind: u8,
    payload: &[u8],
) {
    let reply = |kind: MessageKind, text: String| {
        let writer = Arc::clone(writer);
        async move {
            if let Err(e) = writer.send(kind, text.as_bytes()).await {
                debug!("reply to client: {e}");
            }
        }
    };

    match MessageKind::from_wire(kind) {
        Some(MessageKind::TtySize) => {
            shell.take(client);
            let Some((rows, cols)) = decode_size(payload) else {
                reply(
                    MessageKind::Server,
                    format!("ERROR: SCREEN MSG IS {} BYTES, need 4\r\n", payload.len()),
                )
                .await;
                return;
            };
            if let Err(e) = shell.resize(rows, cols) {
                reply(MessageKind::Server, format!("ERROR: SETSIZE: {e}\r\n")).await;
            }
        }
        Some(MessageKind::TtyName) => {
            // "<pid>:<name>"; clients that are only probing never send it.
            let text = String::from_utf8_lossy(payload);
            match text.split_once(':').and_then(|(pid, name)| {
                pid.parse::<i32>().ok().map(|pid| (pid, name.to_string()))
            }) {
                Some((pid, name)) => shell.register_identity(client, pid, &name),
                None => shell.register_identity(client, 0, text.as_ref()),
            }
        }
        Some(MessageKind::List) => {
            client.send(MessageKind::Server, shell.list(client).as_bytes());
        }
        Some(MessageKind::Exclusive) => shell.exclusive(client).await,
        Some(MessageKind::AskCount) => {
            reply(MessageKind::Count, shell.count().to_string()).await;
        }
        Some(MessageKind::Ping) => {
            if let Err(e) = writer.send(MessageKind::Ack, payload).await {
                debug!("ack: {e}");
            }
        }
        Some(MessageKind::Save) => {
            let path = String::from_utf8_lossy(payload).into_owned();
            match shell.save(&path) {
                Ok(()) => reply(MessageKind::Server, format!("screen saved to {path}\r\n")).await,
                Err(e) => {
                    reply(MessageKind::Server, format!("ERROR: saving screen: {e}\r\n")).await
                }
            }
        }
        Some(MessageKind::Escape) => {
            let alt = String::from_utf8_lossy(payload).to_lowercase() == "alt";
            reply(MessageKind::Server, shell.escapes(alt)).await;
        }
        Some(MessageKind::Forward) => {
            let split = payload.iter().position(|&b| b == 0);
            let parsed = split.and_then(|x| {
                let name = std::str::from_utf8(&payload[..x]).ok()?;
                let socket = std::str::from_utf8(&payload[x + 1..]).ok()?;
                if name.is_empty() || socket.is_empty() {
                    return None;
                }
                Some((name, socket))
            });
            let Some((name, socket)) = parsed else {
                reply(
                    MessageKind::Server,
                    "ERROR: BAD FORWARD MESSAGE\r\n".to_string(),
                )
                .await;
                return;
            };
            if let Err(e) = forward::set_forwarder(name, socket) {
                reply(MessageKind::Server, format!("ERROR: {e}\r\n")).await;
            }
        }
        Some(MessageKind::Ps) => {
            let listing = procinfo::ps_tree(std::process::id() as i32);
            if let Err(e) = writer.send(MessageKind::Ps, listing.as_bytes()).await {
                debug!("ps reply: {e}");
            }
        }
        Some(MessageKind::Dump) => {
            info!("state dump on request:\n{}", shell.dump());
        }
        _ => {
            reply(
                MessageKind::Server,
                format!("ERROR: UNSUPPORTED KIND {kind}\r\n"),
            )
            .await;
        }
    }
}
