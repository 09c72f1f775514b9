use std::fmt;

use thiserror::Error;
use tinyvec::TinyVec;

/// A CoAP option code
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OptionCode(pub(crate) u16);

macro_rules! option_codes {
    {$($name:ident = $val:expr,)*} => {
        impl OptionCode {
            $(
                #[doc = concat!("The `", stringify!($name), "` option")]
                pub const $name: Self = Self($val);
            )*
        }

        impl fmt::Debug for OptionCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "Option({x})"),
                }
            }
        }
    }
}

option_codes! {
    IF_MATCH = 1,
    URI_HOST = 3,
    ETAG = 4,
    IF_NONE_MATCH = 5,
    OBSERVE = 6,
    URI_PORT = 7,
    LOCATION_PATH = 8,
    URI_PATH = 11,
    CONTENT_FORMAT = 12,
    MAX_AGE = 14,
    URI_QUERY = 15,
    ACCEPT = 16,
    LOCATION_QUERY = 20,
    PROXY_URI = 35,
    PROXY_SCHEME = 39,
    SIZE1 = 60,
}

/// The `text/plain` Content-Format value
pub const CF_TEXT_PLAIN: u64 = 0;

/// Value format family of a known option code
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionFormat {
    /// Arbitrary bytes
    Opaque,
    /// UTF-8 text
    String,
    /// Unsigned integer, stored as the minimal big-endian byte string
    Uint,
    /// No value
    Empty,
}

struct OptionDesc {
    code: OptionCode,
    format: OptionFormat,
    min_len: usize,
    max_len: usize,
}

/// Per-code format and length constraints, per RFC 7252 §5.10
const OPTION_TABLE: [OptionDesc; 16] = [
    OptionDesc { code: OptionCode::CONTENT_FORMAT, format: OptionFormat::Opaque, min_len: 0, max_len: 8 },
    OptionDesc { code: OptionCode::ETAG, format: OptionFormat::Opaque, min_len: 1, max_len: 8 },
    OptionDesc { code: OptionCode::LOCATION_PATH, format: OptionFormat::String, min_len: 0, max_len: 255 },
    OptionDesc { code: OptionCode::LOCATION_QUERY, format: OptionFormat::String, min_len: 0, max_len: 255 },
    OptionDesc { code: OptionCode::MAX_AGE, format: OptionFormat::Uint, min_len: 0, max_len: 4 },
    OptionDesc { code: OptionCode::PROXY_URI, format: OptionFormat::String, min_len: 1, max_len: 1034 },
    OptionDesc { code: OptionCode::PROXY_SCHEME, format: OptionFormat::String, min_len: 1, max_len: 255 },
    OptionDesc { code: OptionCode::URI_HOST, format: OptionFormat::String, min_len: 1, max_len: 255 },
    OptionDesc { code: OptionCode::URI_PATH, format: OptionFormat::String, min_len: 0, max_len: 255 },
    OptionDesc { code: OptionCode::URI_PORT, format: OptionFormat::Uint, min_len: 0, max_len: 2 },
    OptionDesc { code: OptionCode::URI_QUERY, format: OptionFormat::String, min_len: 0, max_len: 255 },
    OptionDesc { code: OptionCode::ACCEPT, format: OptionFormat::Uint, min_len: 0, max_len: 2 },
    OptionDesc { code: OptionCode::IF_NONE_MATCH, format: OptionFormat::Empty, min_len: 0, max_len: 0 },
    OptionDesc { code: OptionCode::IF_MATCH, format: OptionFormat::Opaque, min_len: 0, max_len: 8 },
    OptionDesc { code: OptionCode::OBSERVE, format: OptionFormat::Uint, min_len: 0, max_len: 3 },
    OptionDesc { code: OptionCode::SIZE1, format: OptionFormat::Uint, min_len: 0, max_len: 4 },
];

fn desc_of(code: OptionCode) -> Option<&'static OptionDesc> {
    OPTION_TABLE.iter().find(|d| d.code == code)
}

fn check(code: OptionCode, len: usize) -> Result<(), OptionError> {
    let desc = desc_of(code).ok_or(OptionError::Code(code))?;
    if len < desc.min_len || len > desc.max_len {
        return Err(OptionError::Length { code, len });
    }
    Ok(())
}

/// Error constructing an option from application data
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum OptionError {
    /// The code is not in the option table
    #[error("unknown option code {0:?}")]
    Code(OptionCode),
    /// The value length is outside the code's declared range
    #[error("length {len} out of range for option {code:?}")]
    Length {
        /// Option code the value was intended for
        code: OptionCode,
        /// Offending value length
        len: usize,
    },
}

/// A single option: code, length and value
///
/// Options on a message are kept sorted by code so that the delta encoding
/// used on the wire is deterministic and minimal; ties preserve insertion
/// order. Sorting considers the code only, never the value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoapOption {
    code: OptionCode,
    value: TinyVec<[u8; 12]>,
}

impl Default for OptionCode {
    fn default() -> Self {
        Self(0)
    }
}

impl CoapOption {
    /// Construct an option carrying no value
    pub fn empty(code: OptionCode) -> Result<Self, OptionError> {
        check(code, 0)?;
        Ok(Self::raw(code, &[]))
    }

    /// Construct an option with an opaque or string value
    pub fn opaque(code: OptionCode, value: &[u8]) -> Result<Self, OptionError> {
        check(code, value.len())?;
        Ok(Self::raw(code, value))
    }

    /// Construct an option with an unsigned integer value
    ///
    /// The integer is packed as the minimal big-endian byte string with no
    /// leading zero byte; zero packs as a zero-length value.
    pub fn uint(code: OptionCode, value: u64) -> Result<Self, OptionError> {
        let bytes = uint_to_bytes(value);
        check(code, bytes.len())?;
        Ok(Self { code, value: bytes })
    }

    /// Construct without table validation
    ///
    /// Used for decoded options (which may carry codes we do not know) and
    /// for engine-built options whose code and length are fixed and valid.
    pub(crate) fn raw(code: OptionCode, value: &[u8]) -> Self {
        let mut val = TinyVec::new();
        val.extend_from_slice(value);
        Self { code, value: val }
    }

    /// Like [`uint`](Self::uint), skipping table validation
    pub(crate) fn raw_uint(code: OptionCode, value: u64) -> Self {
        Self {
            code,
            value: uint_to_bytes(value),
        }
    }

    /// The option code
    pub fn code(&self) -> OptionCode {
        self.code
    }

    /// Value length in bytes
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the value is zero-length
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// The raw value bytes
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The value as UTF-8 text, if it is valid UTF-8
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Unpack the value as a big-endian unsigned integer
    ///
    /// Only meaningful for values of at most 8 bytes; longer values wrap.
    pub fn uint_value(&self) -> u64 {
        self.value
            .iter()
            .fold(0u64, |v, &b| v.wrapping_shl(8) | u64::from(b))
    }

    /// Format family declared for this code, if known
    pub fn format(&self) -> Option<OptionFormat> {
        desc_of(self.code).map(|d| d.format)
    }
}

fn uint_to_bytes(value: u64) -> TinyVec<[u8; 12]> {
    let mut out = TinyVec::new();
    for shift in (0..8).rev() {
        let b = (value >> (shift * 8)) as u8;
        if !out.is_empty() || b != 0 {
            out.push(b);
        }
    }
    out
}
