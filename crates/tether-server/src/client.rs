//! One attached client, seen from the server side.
//!
//! Output to a client goes through an ordered mailbox drained by a
//! dedicated task, so the PTY reader never blocks on a slow client
//! socket. Enqueueing always "succeeds"; backpressure is absorbed by
//! dropping the oldest queued items once a per-client byte bound is
//! exceeded, which keeps the relative order of everything retained.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use tether_protocol::{MessageKind, MessageWriter};

/// Queued output may hold at most this many payload bytes per client.
const MAILBOX_BYTES_MAX: usize = 64 * 1024 * 1024;

pub type AttachmentWriter = MessageWriter<Box<dyn AsyncWrite + Send + Unpin>>;

struct AttachmentState {
    mailbox: VecDeque<(MessageKind, Vec<u8>)>,
    mailbox_bytes: usize,
    name: String,
    pid: i32,
    primary: bool,
    closed: bool,
}

/// A connected client. Shared between the shell (which fans output in)
/// and the drain task (which writes it out through the codec).
pub struct Attachment {
    state: Mutex<AttachmentState>,
    ready: Notify,
    drain: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Attachment {
    /// Create the attachment and start its drain task. The writer is
    /// shared: the connection handler keeps a clone for direct replies.
    pub fn new(writer: Arc<AttachmentWriter>) -> Arc<Attachment> {
        let attachment = Arc::new(Attachment {
            state: Mutex::new(AttachmentState {
                mailbox: VecDeque::new(),
                mailbox_bytes: 0,
                name: String::new(),
                pid: 0,
                primary: false,
                closed: false,
            }),
            ready: Notify::new(),
            drain: std::sync::Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&attachment).run_drain(writer));
        *attachment.drain.lock().unwrap() = Some(task);
        attachment
    }

    /// Queue a message for the client. Never blocks and always reports
    /// success; output queued after close is silently dropped.
    pub fn send(&self, kind: MessageKind, payload: &[u8]) -> bool {
        if kind == MessageKind::Data && payload.is_empty() {
            return true;
        }
        {
            let mut st = self.state.lock();
            if st.closed {
                return true;
            }
            st.mailbox_bytes += payload.len();
            st.mailbox.push_back((kind, payload.to_vec()));
            while st.mailbox_bytes > MAILBOX_BYTES_MAX {
                match st.mailbox.pop_front() {
                    Some((_, dropped)) => st.mailbox_bytes -= dropped.len(),
                    None => break,
                }
            }
        }
        self.ready.notify_one();
        true
    }

    /// Queue opaque terminal output.
    pub fn output(&self, bytes: &[u8]) -> bool {
        self.send(MessageKind::Data, bytes)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_string();
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.state.lock().pid
    }

    pub fn set_pid(&self, pid: i32) {
        self.state.lock().pid = pid;
    }

    /// An attachment is active once it has identified itself with a
    /// `TtyName`. Probes that never identify are information-only and do
    /// not count as clients.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().pid != 0
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.state.lock().primary
    }

    pub fn make_primary(&self) {
        self.state.lock().primary = true;
    }

    /// Clear the primary flag; returns true if this client held it.
    pub fn yield_primary(&self) -> bool {
        let mut st = self.state.lock();
        let was = st.primary;
        st.primary = false;
        was
    }

    /// Stop accepting output, flush what is queued, and wait for the
    /// drain task to finish with the underlying writer shut down.
    pub async fn close(&self) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.ready.notify_one();
        let task = self.drain.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("drain task join: {e}");
            }
        }
    }

    async fn run_drain(self: Arc<Self>, writer: Arc<AttachmentWriter>) {
        loop {
            self.ready.notified().await;
            loop {
                let item = {
                    let mut st = self.state.lock();
                    match st.mailbox.pop_front() {
                        Some((kind, data)) => {
                            st.mailbox_bytes -= data.len();
                            Some((kind, data))
                        }
                        None => None,
                    }
                };
                let Some((kind, data)) = item else { break };
                let result = if kind == MessageKind::Data {
                    writer.write(&data).await.map(|_| ())
                } else {
                    writer.send(kind, &data).await
                };
                if let Err(e) = result {
                    // The shell notices the dead socket through the read
                    // side and detaches us; just keep draining.
                    debug!("client write: {e}");
                }
            }
            if self.state.lock().closed {
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("client shutdown: {e}");
        }
    }

    /// Snapshot for the server state dump.
    #[must_use]
    pub fn describe(&self) -> String {
        let st = self.state.lock();
        format!(
            "{name} pid={pid} primary={primary} queued={queued}B",
            name = if st.name.is_empty() { "?" } else { &st.name },
            pid = st.pid,
            primary = st.primary,
            queued = st.mailbox_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn boxed_writer(w: tokio::io::DuplexStream) -> Arc<AttachmentWriter> {
        Arc::new(MessageWriter::new(
            Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>
        ))
    }

    #[tokio::test]
    async fn drain_preserves_enqueue_order() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let attachment = Attachment::new(boxed_writer(ours));

        attachment.output(b"first ");
        attachment.send(MessageKind::Server, b"notice");
        attachment.output(b"second");
        attachment.close().await;

        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        let expected = [
            b"first ".as_slice(),
            [0x00, MessageKind::Server as u8, 0, 0, 0, 6].as_slice(),
            b"notice".as_slice(),
            b"second".as_slice(),
        ]
        .concat();
        assert_eq!(wire, expected);
    }

    #[tokio::test]
    async fn close_flushes_queued_output() {
        let (ours, mut theirs) = tokio::io::duplex(1024 * 1024);
        let attachment = Attachment::new(boxed_writer(ours));
        for i in 0..100u32 {
            attachment.output(format!("line {i}\r\n").as_bytes());
        }
        attachment.close().await;

        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        assert!(wire.ends_with(b"line 99\r\n"));
    }

    #[tokio::test]
    async fn output_after_close_is_dropped() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let attachment = Attachment::new(boxed_writer(ours));
        attachment.output(b"kept");
        attachment.close().await;
        assert!(attachment.output(b"dropped"));

        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, b"kept");
    }

    #[tokio::test]
    async fn identity_and_primary_flags() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let attachment = Attachment::new(boxed_writer(ours));
        assert!(!attachment.is_active());
        attachment.set_pid(4242);
        attachment.set_name("pts/3");
        assert!(attachment.is_active());
        assert_eq!(attachment.name(), "pts/3");

        assert!(!attachment.yield_primary());
        attachment.make_primary();
        assert!(attachment.is_primary());
        assert!(attachment.yield_primary());
        assert!(!attachment.is_primary());
        attachment.close().await;
    }
}
