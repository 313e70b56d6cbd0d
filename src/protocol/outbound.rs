//! Request frames sent to the worker.
//!
//! A request is two frames: the image payload, then the macro name. Each frame
//! is a 4-byte big-endian length followed by that many raw bytes.

use std::borrow::Cow;
use std::io::{self, Write};

use thiserror::Error;

/// Problems building an image payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for a {width}x{height} image")]
    SizeMismatch {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },

    #[error("{width}x{height} image is too large")]
    Overflow { width: usize, height: usize },
}

/// Image sent ahead of the macro name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Already-encoded image bytes, passed through untouched.
    Encoded(Vec<u8>),
    /// Packed 4-bytes-per-pixel buffer, reduced to 3 bytes per pixel on the wire.
    Pixels {
        width: usize,
        height: usize,
        rgbx: Vec<u8>,
    },
}

impl ImagePayload {
    /// Bytes of the image frame.
    pub fn wire_bytes(&self) -> Result<Cow<'_, [u8]>, PayloadError> {
        match self {
            Self::Encoded(bytes) => Ok(Cow::Borrowed(bytes)),
            Self::Pixels {
                width,
                height,
                rgbx,
            } => synthesize_rgb(*width, *height, rgbx).map(Cow::Owned),
        }
    }
}

/// Pack a row-major RGBX buffer into RGB, dropping every fourth byte.
///
/// The source must hold exactly `width * height * 4` bytes; the output holds
/// exactly `width * height * 3`.
pub fn synthesize_rgb(width: usize, height: usize, rgbx: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let pixels = width
        .checked_mul(height)
        .filter(|p| p.checked_mul(4).is_some())
        .ok_or(PayloadError::Overflow { width, height })?;
    let expected = pixels * 4;
    if rgbx.len() != expected {
        return Err(PayloadError::SizeMismatch {
            width,
            height,
            expected,
            actual: rgbx.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for pixel in rgbx.chunks_exact(4) {
        rgb.extend_from_slice(&pixel[..3]);
    }
    Ok(rgb)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds the 4-byte length prefix", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)
}

/// Write the image frame and the macro-name frame, then flush.
pub fn write_request<W: Write + ?Sized>(
    writer: &mut W,
    image: &[u8],
    macro_name: &[u8],
) -> io::Result<()> {
    write_frame(writer, image)?;
    write_frame(writer, macro_name)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_drops_fourth_byte() {
        let rgbx = [1, 2, 3, 99, 4, 5, 6, 99];
        assert_eq!(synthesize_rgb(2, 1, &rgbx).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_synthesize_rejects_wrong_length() {
        let err = synthesize_rgb(2, 2, &[0; 15]).unwrap_err();
        assert_eq!(
            err,
            PayloadError::SizeMismatch {
                width: 2,
                height: 2,
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn test_synthesize_overflow() {
        let err = synthesize_rgb(usize::MAX, 2, &[]).unwrap_err();
        assert!(matches!(err, PayloadError::Overflow { .. }));
    }

    #[test]
    fn test_encoded_payload_is_borrowed() {
        let payload = ImagePayload::Encoded(b"\x89PNG".to_vec());
        let bytes = payload.wire_bytes().unwrap();
        assert!(matches!(bytes, Cow::Borrowed(_)));
        assert_eq!(&*bytes, b"\x89PNG");
    }

    #[test]
    fn test_request_layout() {
        let mut wire = Vec::new();
        write_request(&mut wire, b"IMG", b"hello").unwrap();
        assert_eq!(
            wire,
            b"\x00\x00\x00\x03IMG\x00\x00\x00\x05hello".to_vec()
        );
    }

    #[test]
    fn test_empty_frames() {
        let mut wire = Vec::new();
        write_request(&mut wire, b"", b"").unwrap();
        assert_eq!(wire, vec![0; 8]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The image frame's length prefix always equals width * height * 3.
        #[test]
        fn synthesized_frame_length(width in 0usize..40, height in 0usize..40, fill in any::<u8>()) {
            let payload = ImagePayload::Pixels { width, height, rgbx: vec![fill; width * height * 4] };
            let bytes = payload.wire_bytes().unwrap();
            prop_assert_eq!(bytes.len(), width * height * 3);

            let mut wire = Vec::new();
            write_frame(&mut wire, &bytes).unwrap();
            let prefix = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
            prop_assert_eq!(prefix, width * height * 3);
            prop_assert_eq!(wire.len(), 4 + prefix);
        }
    }
}
