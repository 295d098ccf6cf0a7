//! Multipart MJPEG wire framing.
//!
//! Each frame travels as one part of a `multipart/x-mixed-replace`
//! body. The framing here is byte-exact; any HTTP layer in front of
//! the engine only has to set the response content type and copy the
//! chunks through.

use bytes::{BufMut, Bytes, BytesMut};

/// Boundary token, without the leading dashes.
pub const BOUNDARY: &str = "frame";

/// Content type for the streaming response that carries the parts.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wraps one JPEG into its multipart part.
///
/// Produces `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
pub fn encode_part(jpeg: &Bytes) -> Bytes {
    let header = "--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_framing_is_exact() {
        let part = encode_part(&Bytes::from_static(b"\xff\xd8jpegdata\xff\xd9"));
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(b"\xff\xd9\r\n"));
        assert_eq!(
            part.len(),
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".len() + 12 + 2
        );
    }

    #[test]
    fn content_type_names_the_boundary() {
        assert!(STREAM_CONTENT_TYPE.contains(BOUNDARY));
    }
}
