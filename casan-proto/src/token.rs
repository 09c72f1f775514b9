use std::fmt;

/// Maximum length of a token in bytes
pub const MAX_TOKEN_LEN: usize = 8;

/// Opaque correlation handle attached to a message
///
/// Tokens are compared byte-wise. Construction never fails: source data
/// longer than [`MAX_TOKEN_LEN`] is silently truncated, matching the leniency
/// expected of constrained peers.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
    /// The zero-length token
    pub const fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_TOKEN_LEN],
        }
    }

    /// Construct from raw bytes, truncating to [`MAX_TOKEN_LEN`]
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_TOKEN_LEN);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_TOKEN_LEN],
        };
        res.bytes[..len].copy_from_slice(&bytes[..len]);
        res
    }

    /// Length in bytes, at most [`MAX_TOKEN_LEN`]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the token is zero-length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl From<&[u8]> for Token {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(")?;
        for b in self.as_ref() {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}
