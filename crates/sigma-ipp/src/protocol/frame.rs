//! Frame encoding/decoding
//!
//! Frame format (Sigma IPP over serial):
//! - 2 bytes: total length (big-endian), counting the two length bytes themselves
//! - N bytes: ASCII payload of `KEY=VALUE\r\n` lines
//!
//! Frames are read through a [`FrameReader`], which keeps any bytes that arrive
//! past the end of a frame for the next read and drops incomplete frames.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use super::{SigmaError, Transport, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// Field carrying the terminal status code
pub const FIELD_STATUS: &str = "STATUS";
/// Field carrying the progress stage of a multi-frame exchange
pub const FIELD_STAGE: &str = "STAGE";
/// Field carrying the terminal's remaining wait; absent or `0` on the final frame
pub const FIELD_TIMEOUT: &str = "TIMEOUT";
/// Method name echoed by the terminal
pub const FIELD_METHOD: &str = "METHOD";
/// Session id echoed by the terminal
pub const FIELD_SID: &str = "SID";

/// Open-ended `KEY=VALUE` mapping carried by a frame.
///
/// Keys are stored as they appeared on the wire. Lookups try the exact key
/// first and then fall back to a case-insensitive match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, String>);

impl Fields {
    /// Create an empty field set
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a field value
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(v) = self.0.get(key) {
            return Some(v.as_str());
        }
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Insert a field, replacing any previous value for the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Check whether a field is present
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over all fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Take the underlying map
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw bytes including the length prefix
    pub raw: Vec<u8>,
    /// Parsed fields
    pub fields: Fields,
}

impl Frame {
    /// Parse a complete frame (length prefix included)
    fn from_raw(raw: Vec<u8>) -> Self {
        let fields = parse_payload(&raw[LENGTH_PREFIX_LEN..]);
        Self { raw, fields }
    }

    /// Decode a complete frame held in memory.
    ///
    /// Returns `None` unless the declared length matches `bytes` exactly.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LENGTH_PREFIX_LEN {
            return None;
        }
        let declared = BigEndian::read_u16(&bytes[..LENGTH_PREFIX_LEN]) as usize;
        (declared == bytes.len()).then(|| Self::from_raw(bytes.to_vec()))
    }

    /// Look up any field
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    /// `STATUS` field
    pub fn status(&self) -> Option<&str> {
        self.get(FIELD_STATUS).map(str::trim)
    }

    /// `STATUS` field as an integer, if it parses
    pub fn status_code(&self) -> Option<i64> {
        self.status().and_then(|s| s.parse().ok())
    }

    /// `STAGE` field
    pub fn stage(&self) -> Option<&str> {
        self.get(FIELD_STAGE).map(str::trim)
    }

    /// `STAGE` field as an integer, if it parses
    pub fn stage_code(&self) -> Option<i64> {
        self.stage().and_then(|s| s.parse().ok())
    }

    /// `TIMEOUT` field
    pub fn timeout(&self) -> Option<&str> {
        self.get(FIELD_TIMEOUT).map(str::trim)
    }

    /// `METHOD` field
    pub fn method(&self) -> Option<&str> {
        self.get(FIELD_METHOD).map(str::trim)
    }

    /// `SID` field
    pub fn sid(&self) -> Option<&str> {
        self.get(FIELD_SID).map(str::trim)
    }

    /// Whether this is the last frame of its exchange.
    ///
    /// A frame is final when `TIMEOUT` is absent, empty, or `0`.
    pub fn is_final(&self) -> bool {
        match self.timeout() {
            None => true,
            Some(t) => t.is_empty() || t == "0",
        }
    }

    /// Whether `STATUS` is present and not `0`
    pub fn is_rejection(&self) -> bool {
        matches!(self.status(), Some(s) if s != "0")
    }

    /// Whether this frame answers the given request
    pub fn answers(&self, method: &str, sid: &str) -> bool {
        self.method() == Some(method) && self.sid() == Some(sid)
    }
}

/// Encode `KEY=VALUE` lines into a length-prefixed frame.
///
/// Each line gets its own CRLF terminator. Lines must not contain CR or LF, and
/// the whole frame must fit the 16-bit length prefix.
pub fn encode_frame<S: AsRef<str>>(lines: &[S]) -> Result<Vec<u8>, SigmaError> {
    let mut payload = Vec::new();
    for line in lines {
        let line = line.as_ref();
        if line.contains(['\r', '\n']) {
            return Err(SigmaError::Protocol(format!(
                "line contains a line terminator: {:?}",
                line
            )));
        }
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\r\n");
    }

    let total = payload.len() + LENGTH_PREFIX_LEN;
    if total > MAX_FRAME_LEN {
        return Err(SigmaError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            total, MAX_FRAME_LEN
        )));
    }

    let mut bytes = Vec::with_capacity(total);
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    BigEndian::write_u16(&mut len_bytes, total as u16);
    bytes.extend_from_slice(&len_bytes);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parse a frame payload into fields.
///
/// Lines end in CRLF. Non-ASCII bytes become U+FFFD. Lines without `=` are
/// ignored.
fn parse_payload(payload: &[u8]) -> Fields {
    let text: String = payload
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect();

    let mut fields = Fields::new();
    for line in text.split("\r\n") {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key, value);
        }
    }
    fields
}

/// Incremental frame reader over a [`Transport`]
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Attempt to read one frame within `timeout`.
    ///
    /// Returns `Ok(None)` when no complete frame arrived in time, dropping any
    /// incomplete frame. Only transport failures are returned as errors.
    pub fn read_frame<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        timeout: Duration,
    ) -> Result<Option<Frame>, SigmaError> {
        self.read_frame_until(transport, timeout, Instant::now() + timeout)
    }

    /// Read one frame, waiting at most `attempt` for a new frame to start.
    ///
    /// Once a length prefix is buffered the body is read until `deadline`, so a
    /// frame straddling two attempts is reassembled instead of lost. Partial
    /// bytes are only dropped once `deadline` has passed.
    pub fn read_frame_until<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attempt: Duration,
        deadline: Instant,
    ) -> Result<Option<Frame>, SigmaError> {
        let attempt_end = (Instant::now() + attempt).min(deadline);

        if !self.fill(transport, LENGTH_PREFIX_LEN, attempt, attempt_end)? {
            if !self.buffer.is_empty() && Instant::now() >= deadline {
                tracing::debug!(bytes = self.buffer.len(), "dropping partial length prefix");
                self.buffer.clear();
            }
            return Ok(None);
        }

        let total = BigEndian::read_u16(&self.buffer[..LENGTH_PREFIX_LEN]) as usize;
        if total < LENGTH_PREFIX_LEN {
            tracing::debug!(declared = total, "dropping frame with invalid length prefix");
            self.buffer.drain(..LENGTH_PREFIX_LEN);
            return Ok(None);
        }

        if !self.fill(transport, total, attempt, deadline)? {
            tracing::debug!(
                declared = total,
                received = self.buffer.len(),
                "dropping truncated frame"
            );
            self.buffer.clear();
            return Ok(None);
        }

        let raw: Vec<u8> = self.buffer.drain(..total).collect();
        Ok(Some(Frame::from_raw(raw)))
    }

    /// Read until at least `needed` bytes are buffered or `deadline` passes,
    /// one read attempt of at most `attempt` at a time
    fn fill<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        needed: usize,
        attempt: Duration,
        deadline: Instant,
    ) -> Result<bool, SigmaError> {
        while self.buffer.len() < needed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let chunk = transport.read_attempt(remaining.min(attempt))?;
            self.buffer.extend_from_slice(&chunk);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out pre-queued chunks, one per read attempt. An empty chunk is a
    /// quiet attempt that uses up its whole timeout.
    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Transport for ChunkSource {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), SigmaError> {
            Ok(())
        }

        fn read_attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, SigmaError> {
            match self.chunks.pop_front() {
                Some(chunk) if chunk.is_empty() => {
                    std::thread::sleep(timeout);
                    Ok(chunk)
                }
                Some(chunk) => Ok(chunk),
                None => {
                    std::thread::sleep(timeout.min(Duration::from_millis(5)));
                    Ok(Vec::new())
                }
            }
        }

        fn close(&mut self) {}
    }

    fn source(chunks: Vec<Vec<u8>>) -> ChunkSource {
        ChunkSource {
            chunks: chunks.into(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode_frame(&["PROTOCOL=IPP", "METHOD=GET_STATUS"]).unwrap();
        let payload = b"PROTOCOL=IPP\r\nMETHOD=GET_STATUS\r\n";
        assert_eq!(BigEndian::read_u16(&bytes[..2]) as usize, payload.len() + 2);
        assert_eq!(&bytes[2..], payload);
    }

    #[test]
    fn test_encode_empty() {
        let bytes = encode_frame::<&str>(&[]).unwrap();
        assert_eq!(bytes, vec![0x00, 0x02]);
    }

    #[test]
    fn test_encode_rejects_embedded_newline() {
        assert!(matches!(
            encode_frame(&["REFERENCE=a\r\nMETHOD=REVERSAL"]),
            Err(SigmaError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let line = format!("RECEIPT={}", "x".repeat(MAX_FRAME_LEN));
        assert!(matches!(encode_frame(&[line]), Err(SigmaError::Protocol(_))));
    }

    #[test]
    fn test_decode_requires_exact_length() {
        let bytes = encode_frame(&["STATUS=0"]).unwrap();
        assert!(Frame::decode(&bytes).is_some());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_none());
        let mut longer = bytes.clone();
        longer.push(b'x');
        assert!(Frame::decode(&longer).is_none());
        assert!(Frame::decode(&[0x00]).is_none());
    }

    #[test]
    fn test_parse_payload_tolerates_noise() {
        let fields = parse_payload(b"STATUS=0\r\ngarbage line\r\nRECEIPT=A=B\r\nNAME=caf\xe9\r\n");
        assert_eq!(fields.get("STATUS"), Some("0"));
        assert_eq!(fields.get("RECEIPT"), Some("A=B"));
        assert_eq!(fields.get("NAME"), Some("caf\u{FFFD}"));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_fields_case_insensitive_lookup() {
        let mut fields = Fields::new();
        fields.insert("Status", "0");
        assert_eq!(fields.get("STATUS"), Some("0"));
        assert_eq!(fields.get("status"), Some("0"));
        assert!(fields.get("STAGE").is_none());
    }

    #[test]
    fn test_finality() {
        let frame = |payload: &[u8]| {
            let mut raw = vec![0, 0];
            raw.extend_from_slice(payload);
            Frame::from_raw(raw)
        };
        assert!(frame(b"STATUS=0\r\n").is_final());
        assert!(frame(b"STATUS=0\r\nTIMEOUT=0\r\n").is_final());
        assert!(frame(b"STATUS=0\r\nTIMEOUT=\r\n").is_final());
        assert!(!frame(b"STATUS=0\r\nTIMEOUT=60\r\n").is_final());
    }

    #[test]
    fn test_reader_reassembles_split_frame() {
        let bytes = encode_frame(&["STATUS=0", "STAGE=6"]).unwrap();
        let (a, b) = bytes.split_at(5);
        let mut src = source(vec![bytes[..1].to_vec(), a[1..].to_vec(), b.to_vec()]);
        let mut reader = FrameReader::new();

        let frame = reader
            .read_frame(&mut src, Duration::from_millis(200))
            .unwrap()
            .expect("frame");
        assert_eq!(frame.status(), Some("0"));
        assert_eq!(frame.stage(), Some("6"));
        assert_eq!(frame.raw, bytes);
    }

    #[test]
    fn test_reader_resumes_frame_across_attempts() {
        let progress =
            encode_frame(&["METHOD=PURCHASE", "SID=a", "STATUS=0", "STAGE=1", "TIMEOUT=60"]).unwrap();
        let last =
            encode_frame(&["METHOD=PURCHASE", "SID=a", "STATUS=0", "STAGE=6", "TIMEOUT=0"]).unwrap();
        let mut tail = progress[10..].to_vec();
        tail.extend_from_slice(&last);
        // Three quiet attempts between the head and the tail of the first frame
        let mut src = source(vec![progress[..10].to_vec(), vec![], vec![], vec![], tail]);
        let mut reader = FrameReader::new();
        let attempt = Duration::from_millis(5);
        let deadline = Instant::now() + Duration::from_secs(2);

        let first = reader
            .read_frame_until(&mut src, attempt, deadline)
            .unwrap()
            .expect("progress frame");
        assert_eq!(first.stage(), Some("1"));
        let second = reader
            .read_frame_until(&mut src, attempt, deadline)
            .unwrap()
            .expect("final frame");
        assert_eq!(second.stage(), Some("6"));
        assert!(second.is_final());
    }

    #[test]
    fn test_reader_keeps_partial_prefix_until_deadline() {
        let bytes = encode_frame(&["STATUS=0"]).unwrap();
        let mut src = source(vec![bytes[..1].to_vec(), vec![], bytes[1..].to_vec()]);
        let mut reader = FrameReader::new();
        let attempt = Duration::from_millis(5);
        let deadline = Instant::now() + Duration::from_secs(2);

        assert!(reader
            .read_frame_until(&mut src, attempt, deadline)
            .unwrap()
            .is_none());
        assert_eq!(reader.buffered(), 1);
        let frame = reader
            .read_frame_until(&mut src, attempt, deadline)
            .unwrap()
            .expect("frame");
        assert_eq!(frame.status(), Some("0"));
    }

    #[test]
    fn test_parse_payload_splits_on_crlf_only() {
        let fields = parse_payload(b"RECEIPT=line one\nline two\r\nSTATUS=0\r\n");
        assert_eq!(fields.get("RECEIPT"), Some("line one\nline two"));
        assert_eq!(fields.get("STATUS"), Some("0"));
    }

    #[test]
    fn test_reader_keeps_trailing_bytes() {
        let mut bytes = encode_frame(&["STAGE=1"]).unwrap();
        bytes.extend(encode_frame(&["STAGE=2"]).unwrap());
        let mut src = source(vec![bytes]);
        let mut reader = FrameReader::new();

        let first = reader.read_frame(&mut src, Duration::from_millis(50)).unwrap();
        assert_eq!(first.unwrap().stage(), Some("1"));
        assert!(reader.buffered() > 0);
        let second = reader.read_frame(&mut src, Duration::from_millis(50)).unwrap();
        assert_eq!(second.unwrap().stage(), Some("2"));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_drops_truncated_frame() {
        let bytes = encode_frame(&["STATUS=0", "STAGE=6"]).unwrap();
        let mut src = source(vec![bytes[..bytes.len() - 3].to_vec()]);
        let mut reader = FrameReader::new();

        let frame = reader.read_frame(&mut src, Duration::from_millis(30)).unwrap();
        assert!(frame.is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_drops_invalid_prefix() {
        let mut bytes = vec![0x00, 0x01];
        bytes.extend(encode_frame(&["STATUS=0"]).unwrap());
        let mut src = source(vec![bytes]);
        let mut reader = FrameReader::new();

        assert!(reader
            .read_frame(&mut src, Duration::from_millis(30))
            .unwrap()
            .is_none());
        let frame = reader.read_frame(&mut src, Duration::from_millis(30)).unwrap();
        assert_eq!(frame.unwrap().status(), Some("0"));
    }

    #[test]
    fn test_reader_times_out_quietly() {
        let mut src = source(Vec::new());
        let mut reader = FrameReader::new();
        let start = Instant::now();
        assert!(reader
            .read_frame(&mut src, Duration::from_millis(20))
            .unwrap()
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
