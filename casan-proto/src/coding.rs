//! Checked reads on top of `bytes::Buf`
//!
//! The `Buf` accessors panic when the buffer runs dry; network input must
//! instead surface a decode error, so all wire parsing goes through these.

use bytes::Buf;
use thiserror::Error;

/// Ran out of bytes while decoding
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

pub(crate) type Result<T> = std::result::Result<T, UnexpectedEnd>;

pub(crate) trait BufExt {
    fn get_u8_checked(&mut self) -> Result<u8>;
    fn get_u16_checked(&mut self) -> Result<u16>;
    fn copy_checked(&mut self, dest: &mut [u8]) -> Result<()>;
}

impl<T: Buf> BufExt for T {
    fn get_u8_checked(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_u16_checked(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u16())
    }

    fn copy_checked(&mut self, dest: &mut [u8]) -> Result<()> {
        if self.remaining() < dest.len() {
            return Err(UnexpectedEnd);
        }
        self.copy_to_slice(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_reads() {
        let mut buf: &[u8] = &[0xab, 0x01, 0x02];
        assert_eq!(buf.get_u8_checked(), Ok(0xab));
        assert_eq!(buf.get_u16_checked(), Ok(0x0102));
        assert_eq!(buf.get_u8_checked(), Err(UnexpectedEnd));
    }

    #[test]
    fn short_u16() {
        let mut buf: &[u8] = &[0x01];
        assert_eq!(buf.get_u16_checked(), Err(UnexpectedEnd));
        // the failed read must not consume the remaining byte
        assert_eq!(buf.get_u8_checked(), Ok(0x01));
    }
}
