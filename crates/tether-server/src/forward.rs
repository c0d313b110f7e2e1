//! Socket forwarders: tunnel auxiliary byte streams (an SSH agent, for
//! example) from inside the session to a destination chosen by the
//! current primary client.
//!
//! The server listens on a Unix socket inside the session directory and
//! exports that path to the shell via the forwarded variable's name.
//! Whatever connects to it is relayed to the socket path most recently
//! supplied by a `Forward` message, which only the primary client sends.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

static FORWARDERS: Mutex<BTreeMap<String, Arc<Forwarder>>> = Mutex::new(BTreeMap::new());

struct Forwarder {
    name: String,
    remote: Mutex<Option<PathBuf>>,
}

/// Point the named forwarder at a client-side socket path. Fails when no
/// forwarder of that name was configured at startup.
pub fn set_forwarder(name: &str, remote: &str) -> Result<(), String> {
    let forwarder = FORWARDERS.lock().get(name).cloned();
    match forwarder {
        None => Err(format!("no such socket: {name}")),
        Some(f) => {
            info!("forwarder {name} now targets {remote}");
            *f.remote.lock() = Some(PathBuf::from(remote));
            Ok(())
        }
    }
}

/// Create the listener for one forwarded variable and start its accept
/// loop. The target stays unset until a primary client supplies one.
pub fn spawn_forwarder(name: &str, listen_path: &Path) -> io::Result<()> {
    // A stale socket from a dead server blocks the bind.
    let _ = std::fs::remove_file(listen_path);
    let listener = UnixListener::bind(listen_path)?;
    let forwarder = Arc::new(Forwarder {
        name: name.to_string(),
        remote: Mutex::new(None),
    });
    FORWARDERS
        .lock()
        .insert(name.to_string(), Arc::clone(&forwarder));
    tokio::spawn(accept_loop(forwarder, listener));
    Ok(())
}

async fn accept_loop(forwarder: Arc<Forwarder>, listener: UnixListener) {
    loop {
        let conn = match listener.accept().await {
            Ok((conn, _)) => conn,
            Err(e) => {
                warn!("forwarder {} accept: {e}", forwarder.name);
                return;
            }
        };
        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            let remote = forwarder.remote.lock().clone();
            let Some(remote) = remote else {
                debug!("forwarder {}: no target yet, dropping", forwarder.name);
                return;
            };
            if let Err(e) = relay(conn, &remote).await {
                debug!("forwarder {} to {}: {e}", forwarder.name, remote.display());
            }
        });
    }
}

/// Pump bytes both ways until either side closes.
async fn relay(mut conn: UnixStream, remote: &Path) -> io::Result<()> {
    let mut upstream = UnixStream::connect(remote).await?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    Ok(())
}
