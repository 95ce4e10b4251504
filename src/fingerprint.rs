//! Query canonicalisation and fingerprint derivation.
//!
//! Fingerprinting is a pure function of the canonicalised `QueryContext` —
//! no clock, no randomness, no session id — so that a replayed query from a
//! fresh connection produces the same key as the one the store learned it
//! under.

use sha1::{Digest, Sha1};

use crate::event::QueryContext;

/// 20-byte SHA-1 digest identifying an equivalence class of queries.
pub type Fingerprint = [u8; 20];

/// Strip leading/trailing whitespace, collapse interior whitespace runs to a
/// single space, and replace decimal-literal and single-quoted-string
/// literals with `?`. Idempotent: `canonicalise(canonicalise(q)) == canonicalise(q)`.
pub fn canonicalise(query: &[u8]) -> String {
    let text = String::from_utf8_lossy(query);
    let masked = mask_literals(text.trim());
    collapse_whitespace(&masked)
}

fn mask_literals(s: &str) -> String {
    let bytes = s.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        match bytes[i] {
            b'\'' => {
                out.push('?');
                i += 1;
                loop {
                    if i >= len {
                        break;
                    }
                    if bytes[i] == b'\'' {
                        i += 1;
                        if i < len && bytes[i] == b'\'' {
                            // Escaped quote ('') — still inside the literal.
                            i += 1;
                        } else {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            b'0'..=b'9' => {
                let prev_is_ident = i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                if prev_is_ident {
                    out.push(bytes[i] as char);
                    i += 1;
                } else {
                    out.push('?');
                    while i < len && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                        i += 1;
                    }
                }
            }
            _ => {
                let ch_len = utf8_char_len(bytes[i]);
                let end = (i + ch_len).min(len);
                out.push_str(&s[i..end]);
                i = end;
            }
        }
    }
    out
}

fn utf8_char_len(lead: u8) -> usize {
    if lead & 0x80 == 0 {
        1
    } else if lead & 0xE0 == 0xC0 {
        2
    } else if lead & 0xF0 == 0xE0 {
        3
    } else if lead & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

/// SHA-1 of `canonical_query || 0x00 || database || 0x00 || username`. The
/// client IP and timestamp in `QueryContext` do not participate.
pub fn fingerprint(ctx: &QueryContext) -> Fingerprint {
    let canonical = canonicalise(&ctx.query);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(ctx.database.as_bytes());
    hasher.update([0u8]);
    hasher.update(ctx.username.as_bytes());
    hasher.finalize().into()
}
