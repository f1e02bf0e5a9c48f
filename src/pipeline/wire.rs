//! Length-prefixed `bincode` framing over anonymous pipes.
//!
//! Every frame is a 4-byte little-endian length followed by exactly that
//! many bytes of `bincode`-encoded payload. This subsumes the "fixed-size
//! prefix followed by length-prefixed variable payloads" wire shape: rather
//! than hand-framing `Configure`'s three strings separately, the whole order
//! (a `bincode`-derived enum, already length-prefixing its `String`/`Vec`
//! fields) is encoded as one payload behind one frame length.

use std::io::{self, Read, Write};

use bincode::config::Configuration;
use bincode::{Decode, Encode};

use crate::error::{Error, Result};

fn bincode_config() -> Configuration {
    bincode::config::standard()
}

/// Write one length-prefixed frame.
pub fn write_frame<T: Encode>(writer: &mut impl Write, value: &T) -> Result<()> {
    let payload = bincode::encode_to_vec(value, bincode_config())
        .map_err(|e| Error::protocol(format!("failed to encode frame: {e}")))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).map_err(Error::from)?;
    writer.write_all(&payload).map_err(Error::from)?;
    writer.flush().map_err(Error::from)
}

/// Read one length-prefixed frame, or `Ok(None)` on a clean EOF before any
/// bytes of the next frame arrive (the pipe's write end closed).
pub fn read_frame<T: Decode<()>>(reader: &mut impl Read) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(Error::from)?;
    let (value, _) = bincode::decode_from_slice(&payload, bincode_config())
        .map_err(|e| Error::protocol(format!("failed to decode frame: {e}")))?;
    Ok(Some(value))
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of an error if
/// zero bytes were read before EOF (a frame boundary), and still errors on a
/// *partial* read followed by EOF (a torn frame).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::protocol("pipe closed mid-frame"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(true)
}

/// Stable mapping from an [`Error`] variant to the small integer carried by
/// [`crate::pipeline::response::WorkerResponse::Error`], since the full enum
/// (with its `String`/struct payloads) is not itself worth encoding twice —
/// the worker logs the full message and sends only the discriminant.
pub fn error_code(error: &Error) -> i32 {
    match error {
        Error::ConfigInvalid(_) => 1,
        Error::Kernel { code, .. } => *code,
        Error::OvsFailed { code, .. } => *code,
        Error::ProtocolViolation(_) => 4,
        Error::ResourceExhausted(_) => 5,
        Error::NotRoutable { .. } => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_a_byte_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &42u32).unwrap();
        let mut cursor = &buf[..];
        let value: Option<u32> = read_frame(&mut cursor).unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn empty_reader_yields_none() {
        let mut cursor: &[u8] = &[];
        let value: Option<u32> = read_frame(&mut cursor).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn torn_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &42u32).unwrap();
        buf.truncate(buf.len() - 1);
        let mut cursor = &buf[..];
        let result: Result<Option<u32>> = read_frame(&mut cursor);
        assert!(result.is_err());
    }
}
