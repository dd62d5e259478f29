//! G-code word scanner.

/// One address/value word, e.g. `X-1.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    /// Upper-case address letter
    pub letter: u8,
    pub value: f64,
}

/// Scan the words of one line. `(...)` and `;` comments are skipped, as are
/// letters without a number.
pub fn scan(line: &str) -> Vec<Word> {
    let bytes = line.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b';' {
            break;
        }
        if b == b'(' {
            while i < bytes.len() && bytes[i] != b')' {
                i += 1;
            }
            i += 1;
            continue;
        }
        if !b.is_ascii_alphabetic() {
            i += 1;
            continue;
        }

        i += 1;
        let (value, len) = parse_float(&bytes[i..]);
        i += len;
        if let Some(value) = value {
            words.push(Word {
                letter: b.to_ascii_uppercase(),
                value,
            });
        }
    }
    words
}

/// Parse a signed decimal at the start of `bytes`, allowing leading spaces.
/// Returns the value and the number of bytes consumed.
fn parse_float(bytes: &[u8]) -> (Option<f64>, usize) {
    let mut start = 0;
    while start < bytes.len() && bytes[start] == b' ' {
        start += 1;
    }

    let mut end = start;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut has_digit = false;
    let mut has_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => has_digit = true,
            b'.' if !has_dot => has_dot = true,
            _ => break,
        }
        end += 1;
    }

    if !has_digit {
        return (None, start);
    }
    let value = std::str::from_utf8(&bytes[start..end])
        .ok()
        .and_then(|s| s.parse::<f64>().ok());
    (value, end)
}
