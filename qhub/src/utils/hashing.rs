//! Content hashing used for content addressing and idempotency keys.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

// String literals take precedence over comment markers.
#[allow(clippy::unwrap_used)]
static QASM_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r##"(?P<str>"(?:\\(?s:.)|[^"\\\n])*")|(?P<comment>[ \t]*(?://[^\n]*|/\*(?s:.*?)\*/))|(?P<eol>[ \t]*\n)"##,
    )
    .unwrap()
});

#[allow(clippy::unwrap_used)]
static PYTHON_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r##"(?P<str>"""(?s:.*?)"""|'''(?s:.*?)'''|"(?:\\(?s:.)|[^"\\\n])*"|'(?:\\(?s:.)|[^'\\\n])*')|(?P<comment>[ \t]*#[^\n]*)|(?P<eol>[ \t]*\n)"##,
    )
    .unwrap()
});

#[allow(clippy::unwrap_used)]
static PLAIN_TOKENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<eol>[ \t]*\n)").unwrap());

/// Returns the lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incremental hasher for composite keys.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// produce different digests.
#[derive(Debug, Clone, Default)]
pub struct KeyHasher {
    inner: Sha256,
}

impl KeyHasher {
    /// Creates a new key hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one length-prefixed part.
    pub fn part(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    /// Finishes the hash and returns the hex digest.
    #[must_use]
    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

fn tokens_for(name: &str) -> &'static Regex {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("qasm" | "inc") => &*QASM_TOKENS,
        Some("py" | "pyi") => &*PYTHON_TOKENS,
        _ => &*PLAIN_TOKENS,
    }
}

/// Normalises source text for semantic hashing.
///
/// Line endings are unified and trailing blanks and blank lines are dropped.
/// Comments are removed according to the extension of `name`: `//` and
/// `/* */` in OpenQASM, `#` in Python. Other files keep their comments.
/// Indentation and string literals are preserved. Non-UTF-8 content is
/// returned as-is.
#[must_use]
pub fn normalize_semantic(name: &str, bytes: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return bytes.to_vec();
    };
    let text = text.replace("\r\n", "\n");

    let mut normalized = String::with_capacity(text.len());
    let mut last = 0;
    for caps in tokens_for(name).captures_iter(&text) {
        let Some(token) = caps.get(0) else { continue };
        normalized.push_str(&text[last..token.start()]);
        last = token.end();
        if caps.name("str").is_some() {
            normalized.push_str(token.as_str());
        } else if caps.name("eol").is_some() && !normalized.is_empty() && !normalized.ends_with('\n') {
            normalized.push('\n');
        }
    }
    normalized.push_str(&text[last..]);

    let mut normalized = normalized.trim_end().to_string();
    if !normalized.is_empty() {
        normalized.push('\n');
    }
    normalized.into_bytes()
}
