//! The codec shared by batches, log records, and memtable entries.
//!
//! Fixed-width integers are little-endian.  Varints are base-128 with the
//! high bit as a continuation marker, least-significant group first; a
//! 32-bit varint occupies one to five bytes and a 64-bit varint one to ten.
//! Decoders return the remaining buffer so callers can walk a record stream
//! without tracking offsets themselves.

use biometrics::Counter;
use tatl::{HeyListen, Stationary};
use zerror_core::ErrorCore;

use super::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BUFFER_TOO_SHORT: Counter = Counter::new("memlog.coding.buffer_too_short");
static BUFFER_TOO_SHORT_MONITOR: Stationary =
    Stationary::new("memlog.coding.buffer_too_short", &BUFFER_TOO_SHORT);

static VARINT_OVERFLOW: Counter = Counter::new("memlog.coding.varint_overflow");
static VARINT_OVERFLOW_MONITOR: Stationary =
    Stationary::new("memlog.coding.varint_overflow", &VARINT_OVERFLOW);

/// Register the biometrics for the codec.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&BUFFER_TOO_SHORT);
    collector.register_counter(&VARINT_OVERFLOW);
}

/// Register the monitors for the codec.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&BUFFER_TOO_SHORT_MONITOR);
    hey_listen.register_stationary(&VARINT_OVERFLOW_MONITOR);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The maximum number of bytes in an encoded varint32.
pub const MAX_VARINT32_LENGTH: usize = 5;
/// The maximum number of bytes in an encoded varint64.
pub const MAX_VARINT64_LENGTH: usize = 10;

////////////////////////////////////////////// fixed ///////////////////////////////////////////////

/// Encode `value` little-endian into the first four bytes of `dst`.
///
/// # Panics
///
/// Will panic if `dst` holds fewer than four bytes.
pub fn encode_fixed32(dst: &mut [u8], value: u32) {
    dst[..4].copy_from_slice(&value.to_le_bytes());
}

/// Encode `value` little-endian into the first eight bytes of `dst`.
///
/// # Panics
///
/// Will panic if `dst` holds fewer than eight bytes.
pub fn encode_fixed64(dst: &mut [u8], value: u64) {
    dst[..8].copy_from_slice(&value.to_le_bytes());
}

/// Decode a little-endian u32 from the first four bytes of `buf`.
///
/// # Panics
///
/// Will panic if `buf` holds fewer than four bytes.
pub fn decode_fixed32(buf: &[u8]) -> u32 {
    let mut fbuf = [0u8; 4];
    fbuf.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(fbuf)
}

/// Decode a little-endian u64 from the first eight bytes of `buf`.
///
/// # Panics
///
/// Will panic if `buf` holds fewer than eight bytes.
pub fn decode_fixed64(buf: &[u8]) -> u64 {
    let mut fbuf = [0u8; 8];
    fbuf.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(fbuf)
}

/// Append `value` little-endian to `dst`.
pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_le_bytes());
}

/// Append `value` little-endian to `dst`.
pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_le_bytes());
}

////////////////////////////////////////////// varint //////////////////////////////////////////////

/// Encode `value` as a varint into the front of `dst` and return the number
/// of bytes written.
///
/// # Panics
///
/// Will panic if `dst` cannot hold the encoding; [MAX_VARINT32_LENGTH] bytes
/// always suffice.
pub fn encode_varint32(dst: &mut [u8], value: u32) -> usize {
    let mut v = value;
    let mut idx = 0;
    while v >= 0x80 {
        dst[idx] = (v as u8) | 0x80;
        v >>= 7;
        idx += 1;
    }
    dst[idx] = v as u8;
    idx + 1
}

/// Encode `value` as a varint into the front of `dst` and return the number
/// of bytes written.
///
/// # Panics
///
/// Will panic if `dst` cannot hold the encoding; [MAX_VARINT64_LENGTH] bytes
/// always suffice.
pub fn encode_varint64(dst: &mut [u8], value: u64) -> usize {
    let mut v = value;
    let mut idx = 0;
    while v >= 0x80 {
        dst[idx] = (v as u8) | 0x80;
        v >>= 7;
        idx += 1;
    }
    dst[idx] = v as u8;
    idx + 1
}

/// The number of bytes the varint encoding of `value` occupies.
pub fn varint_length(value: u64) -> usize {
    let mut v = value;
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Append the varint encoding of `value` to `dst`.
pub fn put_varint32(dst: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; MAX_VARINT32_LENGTH];
    let sz = encode_varint32(&mut buf, value);
    dst.extend_from_slice(&buf[..sz]);
}

/// Append the varint encoding of `value` to `dst`.
pub fn put_varint64(dst: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; MAX_VARINT64_LENGTH];
    let sz = encode_varint64(&mut buf, value);
    dst.extend_from_slice(&buf[..sz]);
}

/// Decode a varint32 from the front of `buf`.  Returns the value and the
/// unconsumed remainder.  A buffer that ends mid-varint is
/// [Error::BufferTooShort]; a fifth byte carrying a continuation bit is
/// [Error::VarintOverflow], never silent truncation.
pub fn get_varint32(buf: &[u8]) -> Result<(u32, &[u8]), Error> {
    let mut result: u32 = 0;
    for (idx, byte) in buf.iter().enumerate().take(MAX_VARINT32_LENGTH) {
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u32) << (7 * idx);
        } else {
            result |= (*byte as u32) << (7 * idx);
            return Ok((result, &buf[idx + 1..]));
        }
    }
    if buf.len() < MAX_VARINT32_LENGTH {
        BUFFER_TOO_SHORT.click();
        Err(Error::BufferTooShort {
            core: ErrorCore::default(),
            required: buf.len() + 1,
            had: buf.len(),
        })
    } else {
        VARINT_OVERFLOW.click();
        Err(Error::VarintOverflow {
            core: ErrorCore::default(),
            bytes: MAX_VARINT32_LENGTH,
        })
    }
}

/// Decode a varint64 from the front of `buf`.  Returns the value and the
/// unconsumed remainder; errors as [get_varint32], with a ten-byte cap.
pub fn get_varint64(buf: &[u8]) -> Result<(u64, &[u8]), Error> {
    let mut result: u64 = 0;
    for (idx, byte) in buf.iter().enumerate().take(MAX_VARINT64_LENGTH) {
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u64) << (7 * idx);
        } else {
            result |= (*byte as u64) << (7 * idx);
            return Ok((result, &buf[idx + 1..]));
        }
    }
    if buf.len() < MAX_VARINT64_LENGTH {
        BUFFER_TOO_SHORT.click();
        Err(Error::BufferTooShort {
            core: ErrorCore::default(),
            required: buf.len() + 1,
            had: buf.len(),
        })
    } else {
        VARINT_OVERFLOW.click();
        Err(Error::VarintOverflow {
            core: ErrorCore::default(),
            bytes: MAX_VARINT64_LENGTH,
        })
    }
}

////////////////////////////////////////// length-prefixed /////////////////////////////////////////

/// Append a varint32 length prefix and then the bytes of `slice` to `dst`.
pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, slice: &[u8]) {
    put_varint32(dst, slice.len() as u32);
    dst.extend_from_slice(slice);
}

/// Decode a length-prefixed slice from the front of `buf`.  Returns the
/// slice and the unconsumed remainder, or [Error::BufferTooShort] if the
/// prefix promises more bytes than the buffer holds.
pub fn get_length_prefixed_slice(buf: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let (len, rest) = get_varint32(buf)?;
    let len = len as usize;
    if rest.len() < len {
        BUFFER_TOO_SHORT.click();
        return Err(Error::BufferTooShort {
            core: ErrorCore::default(),
            required: len,
            had: rest.len(),
        });
    }
    Ok((&rest[..len], &rest[len..]))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod fixed {
    use super::*;

    #[test]
    fn fixed32_round_trip() {
        for value in [0u32, 1, 0xff, 0x100, 0xdeadbeef, u32::MAX] {
            let mut buf = [0u8; 4];
            encode_fixed32(&mut buf, value);
            assert_eq!(value, decode_fixed32(&buf));
        }
    }

    #[test]
    fn fixed64_round_trip() {
        for value in [0u64, 1, 0xff, 0x100, 0xdeadbeefcafef00d, u64::MAX] {
            let mut buf = [0u8; 8];
            encode_fixed64(&mut buf, value);
            assert_eq!(value, decode_fixed64(&buf));
        }
    }

    #[test]
    fn fixed_is_little_endian() {
        let mut buf = [0u8; 8];
        encode_fixed32(&mut buf, 0x04030201);
        assert_eq!([1, 2, 3, 4], buf[..4]);
        encode_fixed64(&mut buf, 0x0807060504030201);
        assert_eq!([1, 2, 3, 4, 5, 6, 7, 8], buf);
    }

    #[test]
    fn put_appends() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0x04030201);
        put_fixed64(&mut buf, 0x0c0b0a0908070605);
        let exp: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        assert_eq!(exp, &buf[..]);
    }
}


#[cfg(test)]
mod length_prefixed {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello");
        put_length_prefixed_slice(&mut buf, b"");
        put_length_prefixed_slice(&mut buf, b"world");
        let (first, rest) = get_length_prefixed_slice(&buf).unwrap();
        assert_eq!(b"hello", first);
        let (second, rest) = get_length_prefixed_slice(rest).unwrap();
        assert_eq!(b"", second);
        let (third, rest) = get_length_prefixed_slice(rest).unwrap();
        assert_eq!(b"world", third);
        assert!(rest.is_empty());
    }

    #[test]
    fn prefix_spans_a_varint_boundary() {
        let payload = vec![0x5a; 200];
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, &payload);
        assert_eq!([0xc8, 0x01], buf[..2]);
        let (slice, rest) = get_length_prefixed_slice(&buf).unwrap();
        assert_eq!(&payload[..], slice);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_payload() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello");
        assert!(matches!(
            get_length_prefixed_slice(&buf[..4]),
            Err(Error::BufferTooShort { .. })
        ));
    }
}
