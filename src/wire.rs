//! Wire framing and the identity handshake
//!
//! Every message on a player connection is one type byte followed by the
//! payload. How a message ends depends on the engine build: either a fixed end
//! marker is appended, or the message is preceded by its length. `FrameReader`
//! buffers partial reads until a complete frame is available.

use std::io::{self, Read, Write};

/// Default end marker appended after every terminated frame
pub const DEFAULT_END_MARKER: [u8; 3] = [0xFF, 0xFE, 0xFD];

/// Size of the big-endian length header used by `Framing::LengthPrefixed`
const LENGTH_HEADER: usize = 4;

const READ_CHUNK: usize = 4096;

/// Largest type + payload accepted in either direction
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A decoded message: type tag plus payload, without framing bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(packet_type: u8, payload: Vec<u8>) -> Self {
        Frame {
            packet_type,
            payload,
        }
    }
}

/// Message delimiting scheme used by the engine-under-test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// type + payload + marker
    Terminated(Vec<u8>),
    /// u32 big-endian length of (type + payload), then type + payload
    LengthPrefixed,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Terminated(DEFAULT_END_MARKER.to_vec())
    }
}

impl Framing {
    /// Encode a complete frame ready to be written in one call
    pub fn encode(&self, packet_type: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
        let body_len = payload.len() + 1;
        if body_len > MAX_FRAME_LEN {
            return Err(invalid_data(&format!(
                "frame of {body_len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        match self {
            Framing::Terminated(marker) => {
                let mut out = Vec::with_capacity(body_len + marker.len());
                out.push(packet_type);
                out.extend_from_slice(payload);
                out.extend_from_slice(marker);
                Ok(out)
            }
            Framing::LengthPrefixed => {
                let header = u32::try_from(body_len)
                    .map_err(|_| invalid_data("frame length does not fit the header"))?;
                let mut out = Vec::with_capacity(LENGTH_HEADER + body_len);
                out.extend_from_slice(&header.to_be_bytes());
                out.push(packet_type);
                out.extend_from_slice(payload);
                Ok(out)
            }
        }
    }

    /// Try to decode one frame from the front of `buf`
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete frame.
    pub fn decode(&self, buf: &[u8]) -> io::Result<Option<(Frame, usize)>> {
        match self {
            Framing::Terminated(marker) => {
                let Some(end) = find_marker(buf, marker) else {
                    if buf.len() > MAX_FRAME_LEN + marker.len() {
                        return Err(invalid_data("no end marker within the frame size limit"));
                    }
                    return Ok(None);
                };
                if end == 0 {
                    return Err(invalid_data("frame without a type byte"));
                }
                let frame = Frame::new(buf[0], buf[1..end].to_vec());
                Ok(Some((frame, end + marker.len())))
            }
            Framing::LengthPrefixed => {
                if buf.len() < LENGTH_HEADER {
                    return Ok(None);
                }
                let mut header = [0u8; LENGTH_HEADER];
                header.copy_from_slice(&buf[..LENGTH_HEADER]);
                let body_len = u32::from_be_bytes(header) as usize;
                if body_len == 0 {
                    return Err(invalid_data("frame without a type byte"));
                }
                if body_len > MAX_FRAME_LEN {
                    return Err(invalid_data(&format!(
                        "frame header announces {body_len} bytes, limit is {MAX_FRAME_LEN}"
                    )));
                }
                let total = LENGTH_HEADER + body_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let frame = Frame::new(buf[LENGTH_HEADER], buf[LENGTH_HEADER + 1..total].to_vec());
                Ok(Some((frame, total)))
            }
        }
    }
}

fn find_marker(buf: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() || buf.len() < marker.len() {
        return None;
    }
    buf.windows(marker.len()).position(|window| window == marker)
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Parse an end marker given as hex, e.g. `fffefd` or `ff:fe:fd`
pub fn parse_end_marker(s: &str) -> std::result::Result<Vec<u8>, String> {
    let digits: String = s
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '_'))
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits.as_str());
    if digits.is_empty()
        || digits.len() % 2 != 0
        || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(format!(
            "invalid end marker '{s}' (expected an even number of hex digits)"
        ));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}' in end marker", &digits[i..i + 2]))
        })
        .collect()
}

/// Buffers bytes from a reader and splits them into frames
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        FrameReader {
            inner,
            framing,
            buffer: Vec::new(),
        }
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Pop a complete frame from the buffer without touching the reader
    pub fn next_buffered(&mut self) -> io::Result<Option<Frame>> {
        match self.framing.decode(&self.buffer)? {
            Some((frame, used)) => {
                self.buffer.drain(..used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// One read from the underlying reader into the buffer
    ///
    /// Returns the number of bytes read; 0 means the peer closed the stream.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read until one complete frame is available
    ///
    /// Returns `None` if the stream ends first. Bytes of an incomplete trailing
    /// frame stay buffered.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.next_buffered()? {
                return Ok(Some(frame));
            }
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
    }
}

/// Send a player's identity and read back the server-assigned player index
///
/// The identity is written as raw UTF-8 with no framing; the engine answers
/// with exactly one byte.
pub fn handshake<S: Read + Write>(stream: &mut S, identity: &str) -> io::Result<u8> {
    stream.write_all(identity.as_bytes())?;
    stream.flush()?;
    let mut index = [0u8; 1];
    stream.read_exact(&mut index)?;
    Ok(index[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `chunk` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_terminated_encode() {
        let framing = Framing::default();
        assert_eq!(framing.encode(7, b"ab").unwrap(), vec![7, b'a', b'b', 0xFF, 0xFE, 0xFD]);
    }

    #[test]
    fn test_length_prefixed_encode() {
        let framing = Framing::LengthPrefixed;
        assert_eq!(framing.encode(7, b"ab").unwrap(), vec![0, 0, 0, 3, 7, b'a', b'b']);
    }

    #[test]
    fn test_decode_incomplete() {
        let framing = Framing::default();
        assert_eq!(framing.decode(&[7, 1, 2, 0xFF, 0xFE]).unwrap(), None);
        assert_eq!(Framing::LengthPrefixed.decode(&[0, 0, 0, 5, 7]).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_empty_frame() {
        assert!(Framing::default().decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Framing::LengthPrefixed.decode(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        assert!(Framing::LengthPrefixed.encode(1, &payload).is_err());
        assert!(Framing::default().encode(1, &payload).is_err());
        assert_eq!(Framing::LengthPrefixed.encode(1, &payload[1..]).unwrap().len(), 4 + MAX_FRAME_LEN);

        // A corrupt header must not make the reader wait for gigabytes
        let err = Framing::LengthPrefixed.decode(&[0xFF, 0xFF, 0xFF, 0xFF, 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let unterminated = vec![7u8; MAX_FRAME_LEN + 4];
        assert!(Framing::default().decode(&unterminated).is_err());
    }

    #[test]
    fn test_reader_reassembles_trickled_frames() {
        let framing = Framing::default();
        let mut data = framing.encode(1, b"hello").unwrap();
        data.extend(framing.encode(2, b"").unwrap());
        data.extend(framing.encode(3, &[0xFF, 0xFE]).unwrap());
        let trickle = Trickle {
            data,
            pos: 0,
            chunk: 2,
        };

        let mut reader = FrameReader::new(trickle, framing);
        assert_eq!(reader.read_frame().unwrap(), Some(Frame::new(1, b"hello".to_vec())));
        assert_eq!(reader.read_frame().unwrap(), Some(Frame::new(2, Vec::new())));
        assert_eq!(reader.read_frame().unwrap(), Some(Frame::new(3, vec![0xFF, 0xFE])));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn test_reader_keeps_surplus_buffered() {
        let framing = Framing::LengthPrefixed;
        let mut data = framing.encode(9, b"x").unwrap();
        data.extend(framing.encode(4, b"yz").unwrap());

        let mut reader = FrameReader::new(Cursor::new(data), framing);
        assert_eq!(reader.read_frame().unwrap(), Some(Frame::new(9, b"x".to_vec())));
        assert_eq!(reader.buffered(), &[0, 0, 0, 3, 4, b'y', b'z']);
        assert_eq!(reader.next_buffered().unwrap(), Some(Frame::new(4, b"yz".to_vec())));
        assert!(reader.buffered().is_empty());
    }

    #[test]
    fn test_reader_partial_frame_at_eof() {
        let mut reader = FrameReader::new(Cursor::new(vec![5, 6, 0xFF]), Framing::default());
        assert_eq!(reader.read_frame().unwrap(), None);
        assert_eq!(reader.buffered(), &[5, 6, 0xFF]);
    }

    #[test]
    fn test_parse_end_marker() {
        assert_eq!(parse_end_marker("fffefd").unwrap(), vec![0xFF, 0xFE, 0xFD]);
        assert_eq!(parse_end_marker("0x00:ff").unwrap(), vec![0x00, 0xFF]);
        assert!(parse_end_marker("").is_err());
        assert!(parse_end_marker("abc").is_err());
        assert!(parse_end_marker("zz").is_err());
    }

    /// In-memory duplex: reads come from `incoming`, writes land in `outgoing`
    struct Duplex {
        incoming: Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handshake() {
        let mut duplex = Duplex {
            incoming: Cursor::new(vec![1, 42]),
            outgoing: Vec::new(),
        };
        assert_eq!(handshake(&mut duplex, "player-ä").unwrap(), 1);
        assert_eq!(duplex.outgoing, "player-ä".as_bytes());
    }

    #[test]
    fn test_handshake_without_answer() {
        let mut duplex = Duplex {
            incoming: Cursor::new(Vec::new()),
            outgoing: Vec::new(),
        };
        let err = handshake(&mut duplex, "id").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
