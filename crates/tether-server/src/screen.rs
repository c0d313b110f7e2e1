//! Rolling screen-repaint buffers with escape-sequence tracking.
//!
//! The shell's output stream is mirrored into two bounded byte buffers,
//! one per terminal screen (normal and alternate), so that a late-joining
//! client can be repainted with roughly what is on screen. A small closed
//! set of registered escape sequences is recognized as it streams past;
//! everything else is treated as opaque bytes. This is not a terminal
//! emulator: there is no cursor model and no cell grid.

use tether_protocol::{ALT_ENTER, ALT_EXIT, CURSOR_HOME, ERASE_ALL, ERASE_SAVED, SEND_SSH};

/// A byte buffer with a hard capacity that drops from the head so the
/// tail always holds the most recent output.
#[derive(Debug)]
pub struct ScrollBuf {
    data: Vec<u8>,
    cap: usize,
}

impl ScrollBuf {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
        }
    }

    /// Append, shedding from the front when the capacity would be
    /// exceeded. Sheds a little extra so steady-state appends do not
    /// shift the whole buffer on every call.
    pub fn append(&mut self, new: &[u8]) {
        let nl = new.len();
        let ol = self.data.len();
        if nl == 0 {
            return;
        }
        if nl >= self.cap {
            self.data.clear();
            self.data.extend_from_slice(&new[nl - self.cap..]);
        } else if nl + ol < self.cap {
            self.data.extend_from_slice(new);
        } else {
            let extra = 1024.min((self.cap / 8).max(1));
            let drop = (nl + ol + extra).saturating_sub(self.cap).min(ol);
            self.data.drain(..drop);
            self.data.extend_from_slice(new);
        }
    }

    /// Throw away the contents and start over with `seed`.
    pub fn reset_with(&mut self, seed: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(seed);
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The mutable screen state handed to sequence callbacks.
#[derive(Debug)]
pub struct ScreenState {
    pub normal: ScrollBuf,
    pub alt: ScrollBuf,
    pub in_alt: bool,
}

impl ScreenState {
    fn active_mut(&mut self) -> &mut ScrollBuf {
        if self.in_alt {
            &mut self.alt
        } else {
            &mut self.normal
        }
    }
}

/// A sequence callback. Runs after the full sequence (and, for
/// terminated sequences, its body) has been seen. Returning `true`
/// appends the bytes to the active buffer; `false` consumes them.
pub type SeqCallback = Box<dyn FnMut(&mut ScreenState, Option<&[u8]>) -> bool + Send>;

struct SeqDef {
    seq: Vec<u8>,
    term: Vec<u8>,
    callback: SeqCallback,
}

struct InSeq {
    index: usize,
    seen: Vec<u8>,
}

pub struct EscapeBuffer {
    state: ScreenState,
    sequences: Vec<SeqDef>,
    first_bytes: Vec<u8>,
    partial: Vec<u8>,
    partial_cap: usize,
    in_seq: Option<InSeq>,
}

impl EscapeBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 1024 * 1024 } else { capacity };
        Self {
            state: ScreenState {
                normal: ScrollBuf::new(capacity),
                alt: ScrollBuf::new(capacity),
                in_alt: false,
            },
            sequences: Vec::new(),
            first_bytes: Vec::new(),
            partial: Vec::new(),
            partial_cap: 0,
            in_seq: None,
        }
    }

    /// A buffer with the standard screen-tracking set installed:
    /// alt-screen enter/exit, the two erase reseeds, and the send-ssh
    /// marker (consumed so it never re-fires on repaint).
    #[must_use]
    pub fn standard(capacity: usize) -> Self {
        let mut eb = Self::new(capacity);
        eb.register(SEND_SSH, Box::new(|_, _| false));
        eb.register(
            ALT_ENTER,
            Box::new(|st, _| {
                st.in_alt = true;
                false
            }),
        );
        eb.register(
            ALT_EXIT,
            Box::new(|st, _| {
                st.in_alt = false;
                false
            }),
        );
        eb.register(
            ERASE_SAVED,
            Box::new(|st, _| {
                if !st.in_alt {
                    let seed = [ALT_EXIT, ERASE_ALL].concat();
                    st.normal.reset_with(&seed);
                }
                false
            }),
        );
        eb.register(
            ERASE_ALL,
            Box::new(|st, _| {
                if st.in_alt {
                    let seed = [CURSOR_HOME, ERASE_ALL].concat();
                    st.alt.reset_with(&seed);
                }
                false
            }),
        );
        eb
    }

    /// Register a plain sequence.
    pub fn register(&mut self, seq: &[u8], callback: SeqCallback) {
        if seq.is_empty() {
            return;
        }
        if !self.first_bytes.contains(&seq[0]) {
            self.first_bytes.push(seq[0]);
        }
        self.sequences.push(SeqDef {
            seq: seq.to_vec(),
            term: Vec::new(),
            callback,
        });
    }

    /// Register a sequence with a terminator: after the prefix matches,
    /// input is consumed up to and including `term`, and the callback
    /// receives the body between the two.
    pub fn register_terminated(&mut self, seq: &[u8], term: &[u8], callback: SeqCallback) {
        if seq.is_empty() {
            return;
        }
        if term.is_empty() {
            self.register(seq, callback);
            return;
        }
        if !self.first_bytes.contains(&seq[0]) {
            self.first_bytes.push(seq[0]);
        }
        self.sequences.push(SeqDef {
            seq: seq.to_vec(),
            term: term.to_vec(),
            callback,
        });
    }

    #[must_use]
    pub fn in_alt(&self) -> bool {
        self.state.in_alt
    }

    #[must_use]
    pub fn normal(&self) -> &[u8] {
        self.state.normal.as_slice()
    }

    #[must_use]
    pub fn alt(&self) -> &[u8] {
        self.state.alt.as_slice()
    }

    /// The buffer for the screen currently being written.
    #[must_use]
    pub fn active(&self) -> &[u8] {
        if self.state.in_alt {
            self.alt()
        } else {
            self.normal()
        }
    }

    /// Fold any saved partial-match bytes into the active buffer. Used
    /// when the stream is known to be idle (save, teardown, tests).
    pub fn flush(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let partial = std::mem::take(&mut self.partial);
        self.state.active_mut().append(&partial);
    }

    /// Mirror a chunk of shell output into the screen buffers.
    pub fn write(&mut self, buf: &[u8]) {
        if self.first_bytes.is_empty() {
            self.state.active_mut().append(buf);
            return;
        }

        // A saved partial means the previous write ended inside a
        // possible sequence. Top it up and re-feed until it resolves one
        // way or the other.
        let mut buf = buf;
        while !buf.is_empty() && !self.partial.is_empty() {
            let room = self.partial_cap - self.partial.len();
            let take = room.min(buf.len());
            let mut fed = std::mem::take(&mut self.partial);
            fed.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            self.consume(&fed);
        }
        if !self.partial.is_empty() {
            return;
        }
        self.consume(buf);
    }

    fn consume(&mut self, mut buf: &[u8]) {
        'outer: loop {
            // Inside a terminated sequence: run forward to the terminator.
            if let Some(in_seq) = &mut self.in_seq {
                let term = self.sequences[in_seq.index].term.clone();
                match find(buf, &term) {
                    None => {
                        in_seq.seen.extend_from_slice(buf);
                        return;
                    }
                    Some(x) => {
                        in_seq.seen.extend_from_slice(&buf[..x]);
                        buf = &buf[x + term.len()..];
                        let InSeq { index, seen } = self.in_seq.take().unwrap();
                        let keep = (self.sequences[index].callback)(&mut self.state, Some(&seen));
                        if keep {
                            self.state.active_mut().append(&seen);
                        }
                    }
                }
            }

            let Some(x) = buf
                .iter()
                .position(|b| self.first_bytes.contains(b))
            else {
                self.state.active_mut().append(buf);
                return;
            };
            self.state.active_mut().append(&buf[..x]);
            buf = &buf[x..];

            let mut max_partial = 0;
            for i in 0..self.sequences.len() {
                let seq_len = self.sequences[i].seq.len();
                if buf.len() >= seq_len {
                    if buf[..seq_len] == self.sequences[i].seq[..] {
                        if self.sequences[i].term.is_empty() {
                            let keep = (self.sequences[i].callback)(&mut self.state, None);
                            if keep {
                                let seq = self.sequences[i].seq.clone();
                                self.state.active_mut().append(&seq);
                            }
                        } else {
                            self.in_seq = Some(InSeq {
                                index: i,
                                seen: Vec::new(),
                            });
                        }
                        buf = &buf[seq_len..];
                        continue 'outer;
                    }
                } else if self.sequences[i].seq[..buf.len()] == *buf {
                    // Sequence longer than the remaining input and the
                    // input is a strict prefix of it.
                    max_partial = max_partial.max(seq_len);
                }
            }

            if max_partial > 0 {
                self.partial = buf.to_vec();
                self.partial_cap = max_partial;
                return;
            }
            self.state.active_mut().append(&buf[..1]);
            buf = &buf[1..];
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Case {
        name: &'static str,
        size: usize,
        seqs: &'static [&'static [u8]],
        input: &'static [&'static [u8]],
        out: &'static [u8],
        count: usize,
    }

    #[test]
    fn sequence_table() {
        let cases = [
            Case {
                name: "simple",
                size: 64,
                seqs: &[],
                input: &[b"abcdefg"],
                out: b"abcdefg",
                count: 0,
            },
            Case {
                name: "byte by byte",
                size: 64,
                seqs: &[],
                input: &[b"a", b"b", b"c", b"d", b"e", b"f", b"g"],
                out: b"abcdefg",
                count: 0,
            },
            Case {
                name: "overflow",
                size: 4,
                seqs: &[],
                input: &[b"abcdefg"],
                out: b"defg",
                count: 0,
            },
            Case {
                name: "byte by byte overflow",
                size: 4,
                seqs: &[],
                input: &[b"a", b"b", b"c", b"d", b"e", b"f", b"g"],
                out: b"efg",
                count: 0,
            },
            Case {
                name: "one sequence",
                size: 64,
                seqs: &[b"xyz"],
                input: &[b"abcxyzdef"],
                out: b"abcxyzdef",
                count: 1,
            },
            Case {
                name: "sequence x 3",
                size: 64,
                seqs: &[b"xyz"],
                input: &[b"abcxyzxyzdxyzef"],
                out: b"abcxyzxyzdxyzef",
                count: 3,
            },
            Case {
                name: "sequence x 3, split",
                size: 64,
                seqs: &[b"xyz"],
                input: &[b"abcx", b"y", b"zxy", b"zdxyzef"],
                out: b"abcxyzxyzdxyzef",
                count: 3,
            },
            Case {
                name: "2 sequences simple",
                size: 64,
                seqs: &[b"xyw", b"xyzzy"],
                input: &[b"axywaxyzzyx"],
                out: b"axywaxyzzyx",
                count: 2,
            },
            Case {
                name: "2 sequences complex",
                size: 64,
                seqs: &[b"xyw", b"xyzzy"],
                input: &[b"axy", b"wax", b"yz", b"z", b"yx"],
                out: b"axywaxyzzyx",
                count: 2,
            },
        ];

        for case in cases {
            let mut eb = EscapeBuffer::new(case.size);
            let count = Arc::new(AtomicUsize::new(0));
            for seq in case.seqs {
                let count = Arc::clone(&count);
                eb.register(
                    seq,
                    Box::new(move |_, _| {
                        count.fetch_add(1, Ordering::Relaxed);
                        true
                    }),
                );
            }
            for chunk in case.input {
                eb.write(chunk);
            }
            eb.flush();
            assert_eq!(
                eb.normal(),
                case.out,
                "{}: buffer mismatch",
                case.name
            );
            assert_eq!(
                count.load(Ordering::Relaxed),
                case.count,
                "{}: callback count mismatch",
                case.name
            );
        }
    }

    #[test]
    fn alt_screen_cycle_repaints_alt_seed() {
        let mut eb = EscapeBuffer::standard(4096);
        eb.write(b"hello\x1b[?1049h\x1b[2Jalt");
        eb.flush();

        assert!(eb.in_alt());
        assert_eq!(eb.normal(), b"hello");
        // The erase-all reseeds the alt buffer with home + erase so the
        // repaint starts from a clean screen.
        assert_eq!(eb.alt(), b"\x1b[H\x1b[2Jalt");
    }

    #[test]
    fn alt_exit_restores_normal_accumulation() {
        let mut eb = EscapeBuffer::standard(4096);
        eb.write(b"one\x1b[?1049hinside\x1b[?1049ltwo");
        eb.flush();
        assert!(!eb.in_alt());
        assert_eq!(eb.normal(), b"onetwo");
        assert_eq!(eb.alt(), b"inside");
    }

    #[test]
    fn erase_saved_reseeds_normal() {
        let mut eb = EscapeBuffer::standard(4096);
        eb.write(b"history\x1b[3Jfresh");
        eb.flush();
        assert_eq!(eb.normal(), b"\x1b[?1049l\x1b[2Jfresh");
    }

    #[test]
    fn send_ssh_marker_is_never_buffered() {
        let mut eb = EscapeBuffer::standard(4096);
        eb.write(b"before\x1b[zafter");
        eb.flush();
        assert_eq!(eb.normal(), b"beforeafter");
    }

    #[test]
    fn split_alt_enter_across_writes() {
        let mut eb = EscapeBuffer::standard(4096);
        eb.write(b"x\x1b[?10");
        assert!(!eb.in_alt());
        eb.write(b"49hy");
        eb.flush();
        assert!(eb.in_alt());
        assert_eq!(eb.normal(), b"x");
        assert_eq!(eb.alt(), b"y");
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut eb = EscapeBuffer::standard(512);
        for i in 0..200u32 {
            eb.write(format!("chunk {i} with some padding\r\n").as_bytes());
        }
        eb.flush();
        assert!(eb.normal().len() <= 512);
        // The newest bytes survive the head drops.
        let tail = format!("chunk {} with some padding\r\n", 199);
        assert!(eb.normal().ends_with(tail.as_bytes()));
    }

    #[test]
    fn terminated_sequence_runs_to_terminator() {
        let mut eb = EscapeBuffer::new(4096);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        eb.register_terminated(
            b"\x1b]0;",
            b"\x07",
            Box::new(move |_, body| {
                seen_cb.lock().push(body.unwrap().to_vec());
                false
            }),
        );
        eb.write(b"a\x1b]0;my title\x07b");
        eb.write(b"c\x1b]0;sp");
        eb.write(b"lit\x07d");
        eb.flush();
        assert_eq!(eb.normal(), b"abcd");
        assert_eq!(
            *seen.lock(),
            vec![b"my title".to_vec(), b"split".to_vec()]
        );
    }
}
