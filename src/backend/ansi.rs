//! Terminal escape stripping.
//!
//! Raw PTY output carries colour codes, cursor motion and title updates.
//! Classification runs against plain text, so these are removed first.

#[derive(Clone, Copy)]
enum Scan {
    Text,
    Escape,
    Csi,
    Osc,
    OscEscape,
}

/// Remove CSI, OSC and two-byte escape sequences, and carriage returns.
///
/// Invalid UTF-8 is replaced with U+FFFD.
#[must_use]
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut scan = Scan::Text;

    for &byte in input {
        scan = match scan {
            Scan::Text => match byte {
                0x1b => Scan::Escape,
                b'\r' => Scan::Text,
                b => {
                    out.push(b);
                    Scan::Text
                }
            },
            Scan::Escape => match byte {
                b'[' => Scan::Csi,
                b']' => Scan::Osc,
                _ => Scan::Text,
            },
            Scan::Csi if (0x20..=0x3f).contains(&byte) => Scan::Csi,
            Scan::Csi => Scan::Text,
            Scan::Osc => match byte {
                0x07 => Scan::Text,
                0x1b => Scan::OscEscape,
                _ => Scan::Osc,
            },
            Scan::OscEscape if byte == b'\\' => Scan::Text,
            Scan::OscEscape => Scan::Osc,
        };
    }

    match String::from_utf8(out) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// Strip escapes from already-decoded text.
#[must_use]
pub fn strip_ansi_str(input: &str) -> String {
    if input.contains(['\x1b', '\r']) {
        strip_ansi(input.as_bytes())
    } else {
        input.to_owned()
    }
}
