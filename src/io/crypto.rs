//! AES-128-CBC for encrypted HLS segments
//!
//! The HLS muxer opens encrypted segments as `crypto:<name>` and passes the
//! key and IV as hex strings in the open options. Since every output goes
//! through our own AVIO hooks, the encryption that the `crypto` protocol
//! would normally do happens here, on libavutil's AES.

use std::ffi::c_int;

use ffmpeg_next as ffmpeg;

use crate::error::{AvpipeError, FfmpegError, Result};

const BLOCK: usize = 16;

/// Prefix the HLS muxer puts in front of encrypted segment URLs
pub const CRYPTO_PREFIX: &str = "crypto:";

/// Parse a 32-digit hex string into a 16-byte key or IV.
pub fn parse_hex16(s: &str) -> Result<[u8; BLOCK]> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if s.len() != BLOCK * 2 || !s.is_ascii() {
        return Err(AvpipeError::Config(format!(
            "expected 32 hex digits, got {:?}",
            s
        )));
    }
    let mut out = [0u8; BLOCK];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| AvpipeError::Config(format!("invalid hex digits in {:?}", s)))?;
    }
    Ok(out)
}

/// Streaming AES-128-CBC encryptor with PKCS#7 padding
pub struct Aes128Cbc {
    aes: *mut ffmpeg::ffi::AVAES,
    iv: [u8; BLOCK],
    pending: Vec<u8>,
}

// SAFETY: the AVAES state is owned exclusively by this value.
unsafe impl Send for Aes128Cbc {}

impl Aes128Cbc {
    pub fn new(key: &[u8; BLOCK], iv: &[u8; BLOCK]) -> Result<Self> {
        // SAFETY: `av_aes_alloc` returns an uninitialised context or null.
        unsafe {
            let aes = ffmpeg::ffi::av_aes_alloc();
            if aes.is_null() {
                return Err(FfmpegError::Alloc("AES context".to_string()).into());
            }
            if ffmpeg::ffi::av_aes_init(aes, key.as_ptr(), 128, 0) < 0 {
                ffmpeg::ffi::av_free(aes as *mut std::ffi::c_void);
                return Err(AvpipeError::Config("AES-128 key rejected".into()));
            }
            Ok(Self {
                aes,
                iv: *iv,
                pending: Vec::with_capacity(BLOCK),
            })
        }
    }

    /// Build from the hex key and IV strings found in the open options.
    pub fn from_hex(key: &str, iv: &str) -> Result<Self> {
        Self::new(&parse_hex16(key)?, &parse_hex16(iv)?)
    }

    fn encrypt_blocks(&mut self, data: &[u8], out: &mut Vec<u8>) {
        debug_assert_eq!(data.len() % BLOCK, 0);
        if data.is_empty() {
            return;
        }
        let start = out.len();
        out.resize(start + data.len(), 0);
        // SAFETY: `out` has room for `data.len()` bytes; the IV buffer is
        // updated in place so consecutive calls chain correctly.
        unsafe {
            ffmpeg::ffi::av_aes_crypt(
                self.aes,
                out[start..].as_mut_ptr(),
                data.as_ptr(),
                (data.len() / BLOCK) as c_int,
                self.iv.as_mut_ptr(),
                0,
            );
        }
    }

    /// Encrypt every complete block available; keeps the remainder.
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + BLOCK);
        let mut data = data;

        if !self.pending.is_empty() {
            let need = BLOCK - self.pending.len();
            let take = need.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK {
                return out;
            }
            let block = std::mem::take(&mut self.pending);
            self.encrypt_blocks(&block, &mut out);
        }

        let whole = data.len() - data.len() % BLOCK;
        self.encrypt_blocks(&data[..whole], &mut out);
        self.pending.extend_from_slice(&data[whole..]);
        out
    }

    /// Pad and encrypt the final block.
    pub fn finish(&mut self) -> Vec<u8> {
        let pad = BLOCK - self.pending.len();
        let mut last = std::mem::take(&mut self.pending);
        last.resize(BLOCK, pad as u8);
        let mut out = Vec::with_capacity(BLOCK);
        self.encrypt_blocks(&last, &mut out);
        out
    }
}

impl Drop for Aes128Cbc {
    fn drop(&mut self) {
        // SAFETY: allocated by `av_aes_alloc` in `new`.
        unsafe { ffmpeg::ffi::av_freep(&mut self.aes as *mut _ as *mut std::ffi::c_void) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A F.2.1
    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const PT: [u8; 16] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17,
        0x2a,
    ];
    const CT: [u8; 16] = [
        0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9, 0x19,
        0x7d,
    ];

    #[test]
    fn test_parse_hex16() {
        let key = parse_hex16(KEY).unwrap();
        assert_eq!(key[0], 0x2b);
        assert_eq!(key[15], 0x3c);
        assert!(parse_hex16("0x2b7e151628aed2a6abf7158809cf4f3c").is_ok());
        assert!(parse_hex16("2b7e").is_err());
        assert!(parse_hex16("zz7e151628aed2a6abf7158809cf4f3c").is_err());
    }

    #[test]
    fn test_known_answer_across_split_writes() {
        let mut aes = Aes128Cbc::from_hex(KEY, IV).unwrap();
        let mut out = aes.update(&PT[..5]);
        assert!(out.is_empty());
        out.extend(aes.update(&PT[5..]));
        assert_eq!(out, CT);
        let tail = aes.finish();
        assert_eq!(tail.len(), 16);
    }

    #[test]
    fn test_padding_always_adds_a_block() {
        let mut aes = Aes128Cbc::from_hex(KEY, IV).unwrap();
        let mut total = aes.update(&[7u8; 20]).len();
        total += aes.finish().len();
        assert_eq!(total, 32);
    }
}
