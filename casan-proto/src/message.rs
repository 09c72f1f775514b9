use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{BufExt, UnexpectedEnd};
use crate::option::{CoapOption, OptionCode};
use crate::token::{Token, MAX_TOKEN_LEN};

/// The CoAP version CASAN is built on
pub(crate) const CASAN_VERSION: u8 = 1;

/// Marker byte separating the option stream from the payload
const PAYLOAD_MARKER: u8 = 0xff;

/// Fixed header: version/type/token-length, code, 16-bit id
const HEADER_SIZE: usize = 4;

/// CoAP message type
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MsgType {
    /// Confirmable; retransmitted until acknowledged
    Con = 0,
    /// Non-confirmable
    Non = 1,
    /// Acknowledgement
    Ack = 2,
    /// Reset
    Rst = 3,
}

impl MsgType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Con,
            1 => Self::Non,
            2 => Self::Ack,
            _ => Self::Rst,
        }
    }
}

/// CoAP method or response code
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Code(pub(crate) u8);

impl Code {
    /// Empty message
    pub const EMPTY: Self = Self(0);
    /// GET method
    pub const GET: Self = Self(1);
    /// POST method
    pub const POST: Self = Self(2);
    /// PUT method
    pub const PUT: Self = Self(3);
    /// DELETE method
    pub const DELETE: Self = Self(4);
    /// 2.05 Content
    pub const CONTENT: Self = Self((2 << 5) | 5);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Self = Self(4 << 5);
    /// 4.04 Not Found
    pub const NOT_FOUND: Self = Self((4 << 5) | 4);
    /// 4.13 Request Entity Too Large
    pub const TOO_LARGE: Self = Self((4 << 5) | 13);

    /// The code class (high 3 bits)
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The code detail (low 5 bits)
    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// Whether this is a request method code
    pub fn is_method(self) -> bool {
        matches!(self.0, 1..=4)
    }

    /// Index of a request method into a per-method handler table
    pub(crate) fn method_index(self) -> Option<usize> {
        match self.0 {
            1..=4 => Some(self.0 as usize - 1),
            _ => None,
        }
    }
}

impl From<u8> for Code {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

impl From<Code> for u8 {
    fn from(x: Code) -> Self {
        x.0
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EMPTY => f.write_str("EMPTY"),
            Self::GET => f.write_str("GET"),
            Self::POST => f.write_str("POST"),
            Self::PUT => f.write_str("PUT"),
            Self::DELETE => f.write_str("DELETE"),
            _ => write!(f, "{}.{:02}", self.class(), self.detail()),
        }
    }
}

/// Failure to decode a received frame
///
/// A frame that fails to decode is discarded as if never received.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum DecodeError {
    /// The version field did not match the supported version
    #[error("unsupported CoAP version {0}")]
    Version(u8),
    /// The token length field exceeded the maximum
    #[error("token length {0} exceeds maximum")]
    TokenLength(usize),
    /// An option header used the reserved length-extension nibble
    #[error("reserved option header nibble")]
    ReservedNibble,
    /// The frame ended in the middle of a field
    #[error("frame truncated mid-field")]
    UnexpectedEnd,
}

impl From<UnexpectedEnd> for DecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Failure to encode a message within the link MTU
///
/// Nothing is transmitted on failure; the caller must not retransmit a
/// message that never successfully encoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("encoded size {size} exceeds limit {limit}")]
pub struct EncodeError {
    /// Size the message would occupy on the wire
    pub size: usize,
    /// Space actually available
    pub limit: usize,
}

/// A protocol message, either received or under construction
///
/// Options are kept sorted by code (ties in insertion order) so the wire
/// delta encoding is deterministic. A message encoded once caches its wire
/// bytes for retransmission; any mutation invalidates the cache.
#[derive(Clone, Debug)]
pub struct Message {
    ty: MsgType,
    code: Code,
    id: u16,
    token: Token,
    options: Vec<CoapOption>,
    payload: Bytes,
    encoded: Option<Bytes>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            ty: MsgType::Con,
            code: Code::EMPTY,
            id: 0,
            token: Token::empty(),
            options: Vec::new(),
            payload: Bytes::new(),
            encoded: None,
        }
    }
}

impl PartialEq for Message {
    /// Logical equality; the encode cache is ignored
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
            && self.code == other.code
            && self.id == other.id
            && self.token == other.token
            && self.options == other.options
            && self.payload == other.payload
    }
}

impl Eq for Message {}

impl Message {
    /// An empty confirmable message
    pub fn new() -> Self {
        Self::default()
    }

    /// The message type
    pub fn ty(&self) -> MsgType {
        self.ty
    }

    /// The method or response code
    pub fn code(&self) -> Code {
        self.code
    }

    /// The 16-bit message id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The token
    pub fn token(&self) -> Token {
        self.token
    }

    /// The payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// All options, sorted by code
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Set the message type
    pub fn set_type(&mut self, ty: MsgType) {
        self.ty = ty;
        self.encoded = None;
    }

    /// Set the method or response code
    pub fn set_code(&mut self, code: Code) {
        self.code = code;
        self.encoded = None;
    }

    /// Set the message id
    pub fn set_id(&mut self, id: u16) {
        self.id = id;
        self.encoded = None;
    }

    /// Set the token
    pub fn set_token(&mut self, token: Token) {
        self.token = token;
        self.encoded = None;
    }

    /// Set the payload
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        self.encoded = None;
    }

    /// Insert an option, keeping the collection sorted by code
    ///
    /// Options with equal codes keep their insertion order.
    pub fn push_option(&mut self, opt: CoapOption) {
        let pos = self.options.partition_point(|o| o.code() <= opt.code());
        self.options.insert(pos, opt);
        self.encoded = None;
    }

    /// The first option with the given code, if any
    pub fn search_option(&self, code: OptionCode) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.code() == code)
    }

    /// All options with the given code, in order
    pub fn options_with(&self, code: OptionCode) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.code() == code)
    }

    /// Reset to the empty message, dropping options, payload and cache
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The Content-Format option value, if present
    pub fn content_format(&self) -> Option<u64> {
        self.search_option(OptionCode::CONTENT_FORMAT)
            .map(CoapOption::uint_value)
    }

    /// Set the Content-Format option
    ///
    /// Adds the option if absent; an existing value is replaced only when
    /// `overwrite` is true.
    pub fn set_content_format(&mut self, overwrite: bool, cf: u64) {
        self.set_uint_option(OptionCode::CONTENT_FORMAT, overwrite, cf);
    }

    /// The Max-Age option value, if present
    pub fn max_age(&self) -> Option<u64> {
        self.search_option(OptionCode::MAX_AGE)
            .map(CoapOption::uint_value)
    }

    /// Set the Max-Age option, with the same semantics as
    /// [`set_content_format`](Self::set_content_format)
    pub fn set_max_age(&mut self, overwrite: bool, age: u64) {
        self.set_uint_option(OptionCode::MAX_AGE, overwrite, age);
    }

    fn set_uint_option(&mut self, code: OptionCode, overwrite: bool, value: u64) {
        match self.options.iter_mut().find(|o| o.code() == code) {
            Some(opt) => {
                if overwrite {
                    *opt = CoapOption::raw_uint(code, value);
                    self.encoded = None;
                }
            }
            None => self.push_option(CoapOption::raw_uint(code, value)),
        }
    }

    /// Exact encoded size of the message as currently composed
    ///
    /// `anticipate_payload` reserves the payload marker byte even when the
    /// payload is still empty, for estimating space before filling it in.
    pub fn encoded_size(&self, anticipate_payload: bool) -> usize {
        let mut size = HEADER_SIZE + self.token.len();
        let mut prev = 0u16;
        for opt in &self.options {
            let delta = (opt.code().0 - prev) as usize;
            size += 1 + field_ext_size(delta) + field_ext_size(opt.len()) + opt.len();
            prev = opt.code().0;
        }
        if !self.payload.is_empty() || anticipate_payload {
            size += 1 + self.payload.len();
        }
        size
    }

    /// Space left for payload under the given MTU, or 0 if none
    ///
    /// Accounts for the payload marker whether or not a payload is already
    /// present. Never negative, and non-increasing as options or payload are
    /// added.
    pub fn avail_space(&self, mtu: usize) -> usize {
        mtu.saturating_sub(self.encoded_size(true))
    }

    /// Encode into the cache if not already done and return the wire bytes
    ///
    /// Fails without side effect if the message does not fit in `limit`
    /// bytes. Re-sending an already-encoded message reuses the cached bytes
    /// so retransmissions are byte-identical.
    pub fn encoded(&mut self, limit: usize) -> Result<&[u8], EncodeError> {
        match &self.encoded {
            // the limit may have shrunk since the cache was filled
            Some(cache) if cache.len() > limit => {
                return Err(EncodeError {
                    size: cache.len(),
                    limit,
                });
            }
            Some(_) => {}
            None => {
                let size = self.encoded_size(false);
                if size > limit {
                    return Err(EncodeError { size, limit });
                }
                let mut buf = Vec::with_capacity(size);
                self.encode_into(&mut buf);
                debug_assert_eq!(buf.len(), size);
                self.encoded = Some(Bytes::from(buf));
            }
        }
        Ok(self.encoded.as_deref().unwrap_or(&[]))
    }

    /// Whether the encode cache is populated
    pub fn is_encoded(&self) -> bool {
        self.encoded.is_some()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u8(
            (CASAN_VERSION << 6) | ((self.ty as u8 & 0x3) << 4) | (self.token.len() as u8 & 0xf),
        );
        buf.put_u8(self.code.0);
        buf.put_u16(self.id);
        buf.put_slice(self.token.as_ref());

        let mut prev = 0u16;
        for opt in &self.options {
            let delta = (opt.code().0 - prev) as usize;
            let len = opt.len();
            buf.put_u8((field_nibble(delta) << 4) | field_nibble(len));
            put_field_ext(delta, buf);
            put_field_ext(len, buf);
            buf.put_slice(opt.value());
            prev = opt.code().0;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }
    }

    /// Decode a received frame
    ///
    /// For a frame flagged as truncated by the link layer only the fixed
    /// header and token are recovered; options and payload are treated as
    /// absent, which is not an error.
    pub fn decode(data: &[u8], truncated: bool) -> Result<Self, DecodeError> {
        let mut buf = data;
        let b0 = buf.get_u8_checked()?;
        let version = b0 >> 6;
        if version != CASAN_VERSION {
            return Err(DecodeError::Version(version));
        }
        let ty = MsgType::from_bits(b0 >> 4);
        let toklen = (b0 & 0xf) as usize;
        if toklen > MAX_TOKEN_LEN {
            return Err(DecodeError::TokenLength(toklen));
        }
        let code = Code(buf.get_u8_checked()?);
        let id = buf.get_u16_checked()?;
        let mut tok = [0u8; MAX_TOKEN_LEN];
        buf.copy_checked(&mut tok[..toklen])?;

        let mut msg = Self {
            ty,
            code,
            id,
            token: Token::new(&tok[..toklen]),
            ..Self::default()
        };
        if truncated {
            return Ok(msg);
        }

        let mut code_acc = 0u16;
        while buf.has_remaining() {
            let hdr = buf.get_u8();
            if hdr == PAYLOAD_MARKER {
                if !buf.has_remaining() {
                    // a marker followed by nothing is malformed
                    return Err(DecodeError::UnexpectedEnd);
                }
                msg.payload = buf.copy_to_bytes(buf.remaining());
                break;
            }
            let delta = decode_field(hdr >> 4, &mut buf)?;
            let len = decode_field(hdr & 0xf, &mut buf)?;
            code_acc = code_acc.wrapping_add(delta as u16);
            if buf.remaining() < len {
                return Err(DecodeError::UnexpectedEnd);
            }
            let mut value = vec![0u8; len];
            buf.copy_checked(&mut value)?;
            msg.push_option(CoapOption::raw(OptionCode(code_acc), &value));
        }
        msg.encoded = None;
        Ok(msg)
    }
}

/// Header nibble for an option delta or length field
fn field_nibble(value: usize) -> u8 {
    if value >= 269 {
        14
    } else if value >= 13 {
        13
    } else {
        value as u8
    }
}

/// Extension bytes occupied by an option delta or length field
fn field_ext_size(value: usize) -> usize {
    if value >= 269 {
        2
    } else if value >= 13 {
        1
    } else {
        0
    }
}

fn put_field_ext(value: usize, buf: &mut Vec<u8>) {
    if value >= 269 {
        buf.put_u16((value - 269) as u16);
    } else if value >= 13 {
        buf.put_u8((value - 13) as u8);
    }
}

/// Resolve a delta or length nibble, consuming extension bytes as needed
fn decode_field(nibble: u8, buf: &mut &[u8]) -> Result<usize, DecodeError> {
    Ok(match nibble {
        13 => usize::from(buf.get_u8_checked()?) + 13,
        14 => usize::from(buf.get_u16_checked()?) + 269,
        15 => return Err(DecodeError::ReservedNibble),
        n => usize::from(n),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hex_literal::hex;

    use super::*;

    fn sample() -> Message {
        let mut m = Message::new();
        m.set_type(MsgType::Non);
        m.set_code(Code::POST);
        m.set_id(0x1234);
        m.set_token(Token::new(&[0xca, 0xfe]));
        m.push_option(CoapOption::opaque(OptionCode::URI_PATH, b".well-known").unwrap());
        m.push_option(CoapOption::opaque(OptionCode::URI_PATH, b"casan").unwrap());
        m.push_option(CoapOption::opaque(OptionCode::URI_QUERY, b"hello=4").unwrap());
        m
    }

    #[test]
    fn encode_is_byte_exact() {
        let mut m = sample();
        m.set_payload(&b"hi"[..]);
        let wire = m.encoded(127).unwrap().to_vec();
        let expected = hex!(
            "52"           // ver=1 type=NON toklen=2
            "02"           // POST
            "1234"         // id
            "cafe"         // token
            "bb 2e77656c6c2d6b6e6f776e" // delta=11 len=11 ".well-known"
            "05 636173616e"             // delta=0 len=5 "casan"
            "47 68656c6c6f3d34"         // delta=4 len=7 "hello=4"
            "ff 6869"                   // payload marker + "hi"
        );
        assert_eq!(wire, expected);
    }

    #[test]
    fn round_trip() {
        let mut m = sample();
        m.set_payload(&b"payload"[..]);
        let wire = m.encoded(127).unwrap().to_vec();
        let decoded = Message::decode(&wire, false).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn round_trip_without_payload() {
        let mut m = sample();
        let wire = m.encoded(127).unwrap().to_vec();
        let decoded = Message::decode(&wire, false).unwrap();
        assert_eq!(decoded, m);
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn field_extension_boundaries() {
        // nibble selection for the values around each extension threshold
        for (value, nibble, ext) in [
            (0usize, 0u8, 0usize),
            (12, 12, 0),
            (13, 13, 1),
            (268, 13, 1),
            (269, 14, 2),
            (65_804, 14, 2),
        ] {
            assert_eq!(field_nibble(value), nibble, "value {value}");
            assert_eq!(field_ext_size(value), ext, "value {value}");
        }
    }

    #[test]
    fn large_delta_round_trip() {
        // delta 269 exercises the two-byte extension
        let mut m = Message::new();
        m.set_type(MsgType::Non);
        m.push_option(CoapOption::raw(OptionCode(269), b"a"));
        m.push_option(CoapOption::raw(OptionCode(282), b"b")); // delta 13
        let wire = m.encoded(1024).unwrap().to_vec();
        assert_eq!(wire[4] >> 4, 14);
        let decoded = Message::decode(&wire, false).unwrap();
        assert_eq!(decoded.options().len(), 2);
        assert_eq!(decoded.options()[0].code(), OptionCode(269));
        assert_eq!(decoded.options()[1].code(), OptionCode(282));
    }

    #[test]
    fn long_value_round_trip() {
        let long = vec![0x61u8; 300]; // length needs the two-byte extension
        let mut m = Message::new();
        m.push_option(CoapOption::raw(OptionCode::PROXY_URI, &long));
        let wire = m.encoded(1024).unwrap().to_vec();
        let decoded = Message::decode(&wire, false).unwrap();
        assert_eq!(decoded.options()[0].value(), &long[..]);
    }

    #[test]
    fn reserved_nibble_fails() {
        // header 0xf0: reserved delta nibble
        let wire = hex!("40 01 0001 f0");
        assert_matches!(
            Message::decode(&wire, false),
            Err(DecodeError::ReservedNibble)
        );
    }

    #[test]
    fn bad_version_fails() {
        let wire = hex!("80 01 0001");
        assert_matches!(Message::decode(&wire, false), Err(DecodeError::Version(2)));
    }

    #[test]
    fn bad_token_length_fails() {
        // toklen = 9
        let wire = hex!("49 01 0001 000000000000000000");
        assert_matches!(
            Message::decode(&wire, false),
            Err(DecodeError::TokenLength(9))
        );
    }

    #[test]
    fn truncated_recovers_header_and_token() {
        let mut m = sample();
        m.set_payload(&b"payload"[..]);
        let wire = m.encoded(127).unwrap().to_vec();
        let decoded = Message::decode(&wire[..8], true).unwrap();
        assert_eq!(decoded.ty(), MsgType::Non);
        assert_eq!(decoded.code(), Code::POST);
        assert_eq!(decoded.id(), 0x1234);
        assert_eq!(decoded.token(), Token::new(&[0xca, 0xfe]));
        assert!(decoded.options().is_empty());
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn options_stay_sorted() {
        let mut m = Message::new();
        m.push_option(CoapOption::opaque(OptionCode::URI_QUERY, b"b=1").unwrap());
        m.push_option(CoapOption::opaque(OptionCode::URI_PATH, b"x").unwrap());
        m.push_option(CoapOption::opaque(OptionCode::URI_QUERY, b"a=2").unwrap());
        let codes: Vec<_> = m.options().iter().map(|o| o.code()).collect();
        assert_eq!(
            codes,
            [OptionCode::URI_PATH, OptionCode::URI_QUERY, OptionCode::URI_QUERY]
        );
        // equal codes keep insertion order
        assert_eq!(m.options()[1].value(), b"b=1");
        assert_eq!(m.options()[2].value(), b"a=2");
    }

    #[test]
    fn avail_space_is_monotonic() {
        let mtu = 127;
        let mut m = Message::new();
        let mut prev = m.avail_space(mtu);
        m.set_token(Token::new(b"abcd"));
        for i in 0..4 {
            m.push_option(CoapOption::opaque(OptionCode::URI_QUERY, b"key=value").unwrap());
            let avail = m.avail_space(mtu);
            assert!(avail <= prev, "step {i}");
            prev = avail;
        }
        m.set_payload(vec![0u8; 64]);
        assert!(m.avail_space(mtu) <= prev);
        // saturates at zero rather than going negative
        m.set_payload(vec![0u8; 1024]);
        assert_eq!(m.avail_space(mtu), 0);
    }

    #[test]
    fn encode_rejects_oversize() {
        let mut m = Message::new();
        m.set_payload(vec![0u8; 200]);
        let err = m.encoded(127).unwrap_err();
        assert_eq!(err.limit, 127);
        assert!(err.size > 127);
        assert!(!m.is_encoded());
    }

    #[test]
    fn cache_survives_until_mutation() {
        let mut m = sample();
        let first = m.encoded(127).unwrap().to_vec();
        assert!(m.is_encoded());
        let second = m.encoded(127).unwrap().to_vec();
        assert_eq!(first, second);
        m.set_id(0x9999);
        assert!(!m.is_encoded());
        let third = m.encoded(127).unwrap().to_vec();
        assert_ne!(first, third);
    }

    #[test]
    fn cached_bytes_respect_a_lower_limit() {
        let mut m = sample();
        m.set_payload(vec![0u8; 60]);
        let len = m.encoded(127).unwrap().len();
        assert!(m.is_encoded());

        // the limit dropped below the cached size, e.g. after the master
        // renegotiated a smaller MTU
        let err = m.encoded(len - 1).unwrap_err();
        assert_eq!(err.size, len);
        assert_eq!(err.limit, len - 1);

        // the cache itself survives for limits that still fit
        assert_eq!(m.encoded(127).unwrap().len(), len);
    }

    #[test]
    fn content_format_helpers() {
        let mut m = Message::new();
        assert_eq!(m.content_format(), None);
        m.set_content_format(false, 0);
        assert_eq!(m.content_format(), Some(0));
        m.set_content_format(false, 41);
        assert_eq!(m.content_format(), Some(0)); // not overwritten
        m.set_content_format(true, 41);
        assert_eq!(m.content_format(), Some(41));
    }

    #[test]
    fn marker_without_payload_fails() {
        let wire = hex!("40 01 0001 ff");
        assert_matches!(
            Message::decode(&wire, false),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn option_value_overruns_frame() {
        // option claims 5 bytes but only 2 remain
        let wire = hex!("40 01 0001 b5 4142");
        assert_matches!(
            Message::decode(&wire, false),
            Err(DecodeError::UnexpectedEnd)
        );
    }
}
