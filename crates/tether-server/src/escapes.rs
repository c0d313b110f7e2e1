//! Distinct-escape-sequence listing for the `Escape` diagnostic.
//!
//! Walks a screen buffer, tokenizes the escape sequences it finds, and
//! reports the sorted distinct set with names for the handful worth
//! knowing. This is a reporting aid, not an interpreter: unrecognized
//! sequences are listed verbatim without a name.

use std::collections::BTreeSet;

/// Render the distinct escape sequences found in `buf`.
#[must_use]
pub fn describe(buf: &[u8]) -> String {
    let mut seen = BTreeSet::new();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != 0x1b {
            i += 1;
            continue;
        }
        let (seq, consumed) = scan_sequence(&buf[i..]);
        if let Some(seq) = seq {
            seen.insert(seq);
        }
        i += consumed.max(1);
    }

    let mut out = String::from("-----\r\n");
    for seq in seen {
        let rendered = render(&seq);
        match name_of(&seq) {
            Some(name) => out.push_str(&format!("Code: \"{rendered}\" {name}\r\n")),
            None => out.push_str(&format!("Code: \"{rendered}\"\r\n")),
        }
    }
    out.push_str("-----\r\n");
    out
}

/// Extract one escape sequence starting at an ESC byte. Returns the
/// sequence bytes (if complete) and how many input bytes to skip.
fn scan_sequence(buf: &[u8]) -> (Option<Vec<u8>>, usize) {
    if buf.len() < 2 {
        return (None, buf.len());
    }
    match buf[1] {
        b'[' => {
            // CSI: parameter and intermediate bytes, then a final byte.
            let mut j = 2;
            while j < buf.len() && (0x20..=0x3f).contains(&buf[j]) {
                j += 1;
            }
            if j < buf.len() && (0x40..=0x7e).contains(&buf[j]) {
                (Some(buf[..=j].to_vec()), j + 1)
            } else {
                (None, j)
            }
        }
        b']' => {
            // OSC: runs to BEL or ST.
            let mut j = 2;
            while j < buf.len() {
                if buf[j] == 0x07 {
                    return (Some(buf[..=j].to_vec()), j + 1);
                }
                if buf[j] == 0x1b && j + 1 < buf.len() && buf[j + 1] == b'\\' {
                    return (Some(buf[..j + 2].to_vec()), j + 2);
                }
                j += 1;
            }
            (None, buf.len())
        }
        _ => (Some(buf[..2].to_vec()), 2),
    }
}

/// Printable rendering with ESC shown as `\e`.
fn render(seq: &[u8]) -> String {
    let mut out = String::new();
    for &b in seq {
        match b {
            0x1b => out.push_str("\\e"),
            0x07 => out.push_str("\\a"),
            b if (0x20..=0x7e).contains(&b) => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Names for the sequences this system itself cares about plus the
/// common cursor and attribute controls.
fn name_of(seq: &[u8]) -> Option<&'static str> {
    match seq {
        b"\x1b[?1049h" => return Some("Alternate Screen Enter"),
        b"\x1b[?1049l" => return Some("Alternate Screen Exit"),
        b"\x1b[z" => return Some("Agent Re-forward Marker"),
        _ => {}
    }
    if seq.len() >= 3 && seq[1] == b'[' {
        let private = seq[2] == b'?';
        return Some(match seq[seq.len() - 1] {
            b'A' => "Cursor Up",
            b'B' => "Cursor Down",
            b'C' => "Cursor Forward",
            b'D' => "Cursor Back",
            b'H' | b'f' => "Cursor Position",
            b'J' => "Erase in Display",
            b'K' => "Erase in Line",
            b'm' => "Select Graphic Rendition",
            b'r' => "Set Scrolling Region",
            b'h' if private => "DEC Private Mode Set",
            b'l' if private => "DEC Private Mode Reset",
            b'h' => "Set Mode",
            b'l' => "Reset Mode",
            _ => return None,
        });
    }
    if seq.len() >= 2 && seq[1] == b']' {
        return Some("Operating System Command");
    }
    None
}
