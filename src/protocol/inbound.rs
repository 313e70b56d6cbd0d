//! Worker reply parsing.
//!
//! The framed reply is line oriented:
//!
//! ```text
//! BEGIN
//! ATTR            (zero or more)
//! K
//! <len>
//! <len raw bytes>
//! V
//! <len>
//! <len raw bytes>
//! RESULT
//! <len>
//! <len raw bytes, a decimal number>
//! ```
//!
//! Each raw payload is followed by a newline. The newline after the `RESULT`
//! payload is left in the stream and skipped at the start of the next session.
//!
//! A framing error leaves the stream somewhere inside a record. The next
//! session discards lines up to the next `BEGIN` so one bad reply costs only
//! its own request.

use std::io::{self, BufRead, Read};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// Result reported for a session that ended in a framing error.
pub const ERROR_SENTINEL: f64 = -1.0;

/// One key/value attribute emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl AttributeRecord {
    /// Key as text for log output. Invalid UTF-8 is replaced.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// The worker's reply did not follow the framing rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("expected BEGIN, got '{0}'")]
    MissingBegin(String),

    #[error("BEGIN repeated inside a session")]
    DuplicateBegin,

    #[error("unexpected line '{0}'")]
    UnexpectedLine(String),

    #[error("expected '{expected}' marker, got '{got}'")]
    MissingMarker { expected: &'static str, got: String },

    #[error("malformed length field '{0}'")]
    BadLength(String),

    #[error("payload not terminated by a newline")]
    MissingTerminator,
}

/// Header line of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Begin,
    Attr,
    Result,
    Other(String),
}

/// A complete record read from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Begin,
    Attr(AttributeRecord),
    Result(f64),
    Malformed(FramingError),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed { result: f64, attributes: usize },
    Framing(FramingError),
}

impl SessionOutcome {
    /// The session's numeric result, or [`ERROR_SENTINEL`] after a framing error.
    pub fn value(&self) -> f64 {
        match self {
            Self::Completed { result, .. } => *result,
            Self::Framing(_) => ERROR_SENTINEL,
        }
    }
}

/// Receives attributes as soon as they are parsed.
pub trait AttributeSink {
    fn attribute(&mut self, record: AttributeRecord) -> Result<()>;
}

impl<F> AttributeSink for F
where
    F: FnMut(AttributeRecord) -> Result<()>,
{
    fn attribute(&mut self, record: AttributeRecord) -> Result<()> {
        self(record)
    }
}

/// Parse the worker's result like C `strtod`: leading whitespace is skipped
/// and the longest numeric prefix is used, including hex floats, `inf` and
/// `nan`. Text without a numeric prefix yields 0.0.
pub fn parse_decimal(bytes: &[u8]) -> f64 {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start_matches(|c: char| c.is_ascii_whitespace());
    match numeric_prefix(trimmed) {
        Some((value, used)) => {
            if !trimmed[used..].trim().is_empty() {
                debug!(text = %text, value, "Ignoring trailing text after result");
            }
            value
        }
        None => {
            warn!(text = %text, "Worker sent an unparsable result, using 0");
            0.0
        }
    }
}

/// Value and byte length of the longest number at the start of `s`.
fn numeric_prefix(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let (negative, sign_len) = match bytes.first() {
        Some(b'-') => (true, 1),
        Some(b'+') => (false, 1),
        _ => (false, 0),
    };
    let rest = &bytes[sign_len..];

    let (magnitude, len) = if starts_with_ignore_case(rest, b"0x") {
        // A bare "0x" is the number 0 followed by junk
        hex_prefix(&rest[2..]).map_or((0.0, 1), |(v, n)| (v, n + 2))
    } else if starts_with_ignore_case(rest, b"infinity") {
        (f64::INFINITY, 8)
    } else if starts_with_ignore_case(rest, b"inf") {
        (f64::INFINITY, 3)
    } else if starts_with_ignore_case(rest, b"nan") {
        (f64::NAN, 3)
    } else {
        decimal_prefix(rest)?
    };

    let value = if negative { -magnitude } else { magnitude };
    Some((value, sign_len + len))
}

fn starts_with_ignore_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn count_while(bytes: &[u8], pred: impl Fn(u8) -> bool) -> usize {
    bytes.iter().take_while(|&&b| pred(b)).count()
}

/// `digits [. digits] [e [sign] digits]`, at least one mantissa digit.
fn decimal_prefix(bytes: &[u8]) -> Option<(f64, usize)> {
    let int_digits = count_while(bytes, |b| b.is_ascii_digit());
    let mut end = int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = count_while(&bytes[end + 1..], |b| b.is_ascii_digit());
        end += 1 + frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = count_while(&bytes[exp..], |b| b.is_ascii_digit());
        if exp_digits > 0 {
            end = exp + exp_digits;
        }
    }
    let text = std::str::from_utf8(&bytes[..end]).ok()?;
    Some((text.parse::<f64>().ok()?, end))
}

/// Hex mantissa with optional binary exponent, after the `0x`.
fn hex_prefix(bytes: &[u8]) -> Option<(f64, usize)> {
    let mut value = 0.0f64;
    let mut end = 0;
    let mut digits = 0;
    while let Some(d) = bytes.get(end).and_then(|&b| (b as char).to_digit(16)) {
        value = value * 16.0 + f64::from(d);
        end += 1;
        digits += 1;
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        let mut scale = 1.0 / 16.0;
        while let Some(d) = bytes.get(end).and_then(|&b| (b as char).to_digit(16)) {
            value += f64::from(d) * scale;
            scale /= 16.0;
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'p' | b'P')) {
        let mut exp = end + 1;
        let negative = match bytes.get(exp) {
            Some(b'-') => {
                exp += 1;
                true
            }
            Some(b'+') => {
                exp += 1;
                false
            }
            _ => false,
        };
        let exp_digits = count_while(&bytes[exp..], |b| b.is_ascii_digit());
        if exp_digits > 0 {
            let power = bytes[exp..exp + exp_digits]
                .iter()
                .fold(0i32, |acc, &b| acc.saturating_mul(10).saturating_add(i32::from(b - b'0')));
            value *= 2f64.powi(if negative { -power } else { power });
            end = exp + exp_digits;
        }
    }
    Some((value, end))
}

/// Buffered reader over the worker's output, shared by consecutive sessions.
#[derive(Debug)]
pub struct WireReader<R> {
    inner: R,
    /// The previous session stopped right after a RESULT payload.
    skip_blank: bool,
    /// The previous session ended in a framing error.
    resync: bool,
}

impl<R: BufRead> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            skip_blank: false,
            resync: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one line without its terminator. Returns `None` on EOF.
    pub(crate) fn read_line_or_eof(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.inner.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read one line; EOF is an error.
    pub(crate) fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.read_line_or_eof()?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-record")
        })
    }

    /// Read exactly `len` bytes. Memory grows with the data actually received.
    pub(crate) fn read_payload(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut payload)?;
        if payload.len() != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {} of {} payload bytes", payload.len(), len),
            ));
        }
        Ok(payload)
    }

    /// Consume the newline that ends a payload.
    pub(crate) fn read_terminator(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        self.inner.read_exact(&mut byte)?;
        Ok(byte[0] == b'\n')
    }

    /// Discard lines up to and including the next `BEGIN`. Returns how many
    /// lines were dropped.
    fn seek_begin(&mut self) -> io::Result<usize> {
        self.skip_blank = false;
        let mut skipped = 0;
        while self.read_line()? != b"BEGIN" {
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Read the header line of the next record.
    pub fn read_header(&mut self) -> io::Result<Header> {
        let mut line = self.read_line()?;
        if std::mem::take(&mut self.skip_blank) && line.is_empty() {
            line = self.read_line()?;
        }
        trace!(line = %String::from_utf8_lossy(&line), "Worker header");
        Ok(match line.as_slice() {
            b"BEGIN" => Header::Begin,
            b"ATTR" => Header::Attr,
            b"RESULT" => Header::Result,
            other => Header::Other(String::from_utf8_lossy(other).into_owned()),
        })
    }

    /// Read the next complete record.
    pub fn next_record(&mut self) -> io::Result<Record> {
        match self.read_header()? {
            Header::Begin => Ok(Record::Begin),
            Header::Attr => self.read_attr_body(),
            Header::Result => self.read_result_body(),
            Header::Other(line) => Ok(Record::Malformed(FramingError::UnexpectedLine(line))),
        }
    }

    fn read_attr_body(&mut self) -> io::Result<Record> {
        let key = match self.read_field("K")? {
            Ok(key) => key,
            Err(e) => return Ok(Record::Malformed(e)),
        };
        let value = match self.read_field("V")? {
            Ok(value) => value,
            Err(e) => return Ok(Record::Malformed(e)),
        };
        Ok(Record::Attr(AttributeRecord { key, value }))
    }

    fn read_result_body(&mut self) -> io::Result<Record> {
        let payload = match self.read_sized()? {
            Ok(payload) => payload,
            Err(e) => return Ok(Record::Malformed(e)),
        };
        self.skip_blank = true;
        Ok(Record::Result(parse_decimal(&payload)))
    }

    /// `<marker>` line, then a sized payload and its newline.
    fn read_field(
        &mut self,
        marker: &'static str,
    ) -> io::Result<std::result::Result<Vec<u8>, FramingError>> {
        let line = self.read_line()?;
        if line != marker.as_bytes() {
            return Ok(Err(FramingError::MissingMarker {
                expected: marker,
                got: String::from_utf8_lossy(&line).into_owned(),
            }));
        }
        let payload = match self.read_sized()? {
            Ok(payload) => payload,
            Err(e) => return Ok(Err(e)),
        };
        if !self.read_terminator()? {
            return Ok(Err(FramingError::MissingTerminator));
        }
        Ok(Ok(payload))
    }

    /// Decimal length line followed by that many raw bytes.
    fn read_sized(&mut self) -> io::Result<std::result::Result<Vec<u8>, FramingError>> {
        let line = self.read_line()?;
        let len = std::str::from_utf8(&line)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok());
        match len {
            Some(len) => Ok(Ok(self.read_payload(len)?)),
            None => Ok(Err(FramingError::BadLength(
                String::from_utf8_lossy(&line).into_owned(),
            ))),
        }
    }

    /// Read a legacy reply: one line holding the decimal result.
    pub fn read_bare_result(&mut self) -> io::Result<SessionOutcome> {
        let mut line = self.read_line()?;
        if std::mem::take(&mut self.skip_blank) && line.is_empty() {
            line = self.read_line()?;
        }
        Ok(SessionOutcome::Completed {
            result: parse_decimal(&line),
            attributes: 0,
        })
    }
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitBegin,
    InSession,
    Done,
    Error,
}

/// One framed reply, from `BEGIN` to `RESULT`.
pub struct ProtocolSession<'a, R> {
    reader: &'a mut WireReader<R>,
    state: SessionState,
    attributes: usize,
}

impl<'a, R: BufRead> ProtocolSession<'a, R> {
    pub fn new(reader: &'a mut WireReader<R>) -> Self {
        Self {
            reader,
            state: SessionState::AwaitBegin,
            attributes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to `Done` or `Error`, forwarding attributes to `sink`.
    ///
    /// Framing errors end the session with [`SessionOutcome::Framing`]; nothing
    /// further is read until the next session, which first skips to `BEGIN`.
    /// I/O failures and sink failures are returned as errors.
    pub fn run<S: AttributeSink + ?Sized>(&mut self, sink: &mut S) -> Result<SessionOutcome> {
        if self.state == SessionState::AwaitBegin && std::mem::take(&mut self.reader.resync) {
            let skipped = self.reader.seek_begin()?;
            debug!(skipped, "Resynchronized on BEGIN after framing error");
            self.state = SessionState::InSession;
        }
        loop {
            match self.state {
                SessionState::AwaitBegin => match self.reader.read_header()? {
                    Header::Begin => self.state = SessionState::InSession,
                    Header::Attr => return Ok(self.fail(FramingError::MissingBegin("ATTR".into()))),
                    Header::Result => {
                        return Ok(self.fail(FramingError::MissingBegin("RESULT".into())));
                    }
                    Header::Other(line) => return Ok(self.fail(FramingError::MissingBegin(line))),
                },
                SessionState::InSession => match self.reader.next_record()? {
                    Record::Begin => return Ok(self.fail(FramingError::DuplicateBegin)),
                    Record::Attr(record) => {
                        trace!(key = %record.key_lossy(), "Worker attribute");
                        sink.attribute(record)?;
                        self.attributes += 1;
                    }
                    Record::Result(result) => {
                        self.state = SessionState::Done;
                        return Ok(SessionOutcome::Completed {
                            result,
                            attributes: self.attributes,
                        });
                    }
                    Record::Malformed(e) => return Ok(self.fail(e)),
                },
                SessionState::Done | SessionState::Error => {
                    return Err(io::Error::other("protocol session already finished").into());
                }
            }
        }
    }

    fn fail(&mut self, error: FramingError) -> SessionOutcome {
        warn!(state = ?self.state, "Framing error from worker: {}", error);
        self.state = SessionState::Error;
        self.reader.resync = true;
        SessionOutcome::Framing(error)
    }
}
