//! Wire protocol shared by the tether server and clients.
//!
//! A single duplex byte stream carries both raw terminal bytes and typed
//! control messages. Byte 0 is reserved as the message-start escape: a
//! literal 0 in terminal data crosses the wire doubled, and `0 kind len4`
//! introduces a length-prefixed control message. See [`codec`] for the
//! framing rules.

mod codec;

pub use codec::{MessageReader, MessageWriter};

use std::fmt;

/// Control-message kinds, in stable wire order. `Data` is kind 0 and is
/// never framed; it travels as stuffed opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Data = 0,
    /// 4-byte big-endian `(rows, cols)` from a client.
    TtySize,
    /// ASCII `<pid>:<tty-name>` identifying a client.
    TtyName,
    /// Server-to-client text, written to the client's terminal.
    Server,
    Start,
    Wait,
    List,
    Count,
    AskCount,
    Exclusive,
    Save,
    Escape,
    /// Sent to a client when another client takes over.
    Preempt,
    /// Sent to a client when it becomes primary.
    Primary,
    /// UTF-8 `<var>\0<socket-path>`.
    Forward,
    Ps,
    Ping,
    Ack,
    /// Ask the server to dump its internal state to its log.
    Dump,
}

impl MessageKind {
    /// Decode a wire kind byte. Returns `None` for kinds this build does
    /// not know; the peer is told rather than torn down.
    pub fn from_wire(b: u8) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match b {
            0 => Data,
            1 => TtySize,
            2 => TtyName,
            3 => Server,
            4 => Start,
            5 => Wait,
            6 => List,
            7 => Count,
            8 => AskCount,
            9 => Exclusive,
            10 => Save,
            11 => Escape,
            12 => Preempt,
            13 => Primary,
            14 => Forward,
            15 => Ps,
            16 => Ping,
            17 => Ack,
            18 => Dump,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Data => "data",
            MessageKind::TtySize => "ttysize",
            MessageKind::TtyName => "ttyname",
            MessageKind::Server => "server",
            MessageKind::Start => "start",
            MessageKind::Wait => "wait",
            MessageKind::List => "list",
            MessageKind::Count => "count",
            MessageKind::AskCount => "askcount",
            MessageKind::Exclusive => "exclusive",
            MessageKind::Save => "save",
            MessageKind::Escape => "escape",
            MessageKind::Preempt => "preempt",
            MessageKind::Primary => "primary",
            MessageKind::Forward => "forward",
            MessageKind::Ps => "ps",
            MessageKind::Ping => "ping",
            MessageKind::Ack => "ack",
            MessageKind::Dump => "dump",
        };
        f.write_str(name)
    }
}

// Escape sequences used to track and replay screen-buffer switches.
//
// For details: http://invisible-island.net/xterm/ctlseqs/ctlseqs.html

/// Save cursor, switch to the alternate screen buffer.
pub const ALT_ENTER: &[u8] = b"\x1b[?1049h";
/// Switch to the normal screen buffer, restore cursor.
pub const ALT_EXIT: &[u8] = b"\x1b[?1049l";
/// Erase all.
pub const ERASE_ALL: &[u8] = b"\x1b[2J";
/// Erase saved lines.
pub const ERASE_SAVED: &[u8] = b"\x1b[3J";
/// Cursor home.
pub const CURSOR_HOME: &[u8] = b"\x1b[H";
/// Clear sequence sent ahead of a repaint on attach.
pub const CLEAR: &[u8] = b"\x1b[?1049l\x1b[J\x1b[3J\x1b[J";
/// Magic marker a session-side helper emits to ask the attached client
/// to re-forward its SSH agent. Never stored in the repaint buffers.
pub const SEND_SSH: &[u8] = b"\x1b[z";

/// Encode terminal geometry as the 4-byte `TtySize` payload.
pub fn encode_size(rows: u16, cols: u16) -> [u8; 4] {
    let r = rows.to_be_bytes();
    let c = cols.to_be_bytes();
    [r[0], r[1], c[0], c[1]]
}

/// Decode a `TtySize` payload. Returns `None` unless exactly 4 bytes.
pub fn decode_size(buf: &[u8]) -> Option<(u16, u16)> {
    if buf.len() != 4 {
        return None;
    }
    let rows = u16::from_be_bytes([buf[0], buf[1]]);
    let cols = u16::from_be_bytes([buf[2], buf[3]]);
    Some((rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_order_is_stable() {
        // The numeric order is wire compatibility; a reorder is a protocol
        // break even if the code still compiles.
        assert_eq!(MessageKind::Data as u8, 0);
        assert_eq!(MessageKind::TtySize as u8, 1);
        assert_eq!(MessageKind::TtyName as u8, 2);
        assert_eq!(MessageKind::Server as u8, 3);
        assert_eq!(MessageKind::Start as u8, 4);
        assert_eq!(MessageKind::Wait as u8, 5);
        assert_eq!(MessageKind::List as u8, 6);
        assert_eq!(MessageKind::Count as u8, 7);
        assert_eq!(MessageKind::AskCount as u8, 8);
        assert_eq!(MessageKind::Exclusive as u8, 9);
        assert_eq!(MessageKind::Save as u8, 10);
        assert_eq!(MessageKind::Escape as u8, 11);
        assert_eq!(MessageKind::Preempt as u8, 12);
        assert_eq!(MessageKind::Primary as u8, 13);
        assert_eq!(MessageKind::Forward as u8, 14);
        assert_eq!(MessageKind::Ps as u8, 15);
        assert_eq!(MessageKind::Ping as u8, 16);
        assert_eq!(MessageKind::Ack as u8, 17);
        assert_eq!(MessageKind::Dump as u8, 18);
    }

    #[test]
    fn kind_round_trips_through_wire_byte() {
        for b in 0..=18u8 {
            let kind = MessageKind::from_wire(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert!(MessageKind::from_wire(19).is_none());
        assert!(MessageKind::from_wire(255).is_none());
    }

    #[test]
    fn size_round_trip() {
        let buf = encode_size(40, 80);
        assert_eq!(buf, [0x00, 0x28, 0x00, 0x50]);
        assert_eq!(decode_size(&buf), Some((40, 80)));
        assert_eq!(decode_size(&buf[..3]), None);
        assert_eq!(decode_size(b"12345"), None);
    }
}
