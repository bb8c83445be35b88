//! Event stream reader.
//!
//! Turns an arbitrarily chunked byte stream into ordered `(event, payload)`
//! frames. Frames are separated by a blank line and carry `event:` and
//! `data:` fields.
//!
//! Some transports re-serialize the stream so every real newline arrives as
//! the two-character escape `\n`. The reader decides once per connection
//! which interpretation applies (see [`detect_newline_mode`]) and then
//! normalizes every chunk the same way until the stream ends.

use crate::{Result, TetherError};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Event name used when a frame has no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// Raw chunks as delivered by a transport.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Ordered frames decoded from a [`ByteStream`].
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Escaped field boundaries that only appear when real newlines were escaped.
const ESCAPED_FIELD_MARKERS: [&str; 2] = ["\\nevent:", "\\ndata:"];

/// One named event and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// How newlines are encoded on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewlineMode {
    /// Newlines arrive as real line feeds.
    Plain,
    /// Newlines arrive as the two characters `\` `n`.
    Escaped,
}

/// Decide the newline mode for a connection.
///
/// A prior decision always wins. Otherwise a real newline means `Plain`, and
/// an escaped field boundary with no real newline means `Escaped`. Anything
/// else stays undecided so the caller keeps buffering.
pub fn detect_newline_mode(prior: Option<NewlineMode>, buffer: &str) -> Option<NewlineMode> {
    if prior.is_some() {
        return prior;
    }
    if buffer.contains('\n') {
        return Some(NewlineMode::Plain);
    }
    if ESCAPED_FIELD_MARKERS.iter().any(|marker| buffer.contains(marker)) {
        return Some(NewlineMode::Escaped);
    }
    None
}

/// Incremental frame decoder. Feed chunks, collect complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    mode: Option<NewlineMode>,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial_utf8: Vec<u8>,
    /// Text received before the newline mode was decided.
    undecided: String,
    /// Suffix that may be the start of a line terminator split across chunks.
    held: String,
    /// Normalized text awaiting a frame boundary.
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The newline mode decided for this connection, if any.
    pub fn mode(&self) -> Option<NewlineMode> {
        self.mode
    }

    /// Feed a chunk and drain every frame it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let text = self.decode_utf8(bytes);

        if self.mode.is_none() {
            self.undecided.push_str(&text);
            self.mode = detect_newline_mode(None, &self.undecided);
            match self.mode {
                Some(mode) => {
                    debug!(target: "tether::stream", "Newline mode decided: {:?}", mode);
                    let text = std::mem::take(&mut self.undecided);
                    self.push_text(&text);
                }
                None => return Vec::new(),
            }
        } else {
            self.push_text(&text);
        }

        self.drain_frames()
    }

    /// Flush at a clean end of stream. A final frame that was never followed
    /// by a blank line is still emitted.
    pub fn finish(mut self) -> Vec<Frame> {
        if !self.partial_utf8.is_empty() {
            let tail = String::from_utf8_lossy(&self.partial_utf8).into_owned();
            self.partial_utf8.clear();
            self.undecided.push_str(&tail);
            if self.mode.is_some() {
                let tail = std::mem::take(&mut self.undecided);
                self.push_text(&tail);
            }
        }

        if self.mode.is_none() {
            let mode = if self.undecided.contains("\\n") {
                NewlineMode::Escaped
            } else {
                NewlineMode::Plain
            };
            self.mode = Some(mode);
            let text = std::mem::take(&mut self.undecided);
            self.push_text(&text);
        }

        let held = std::mem::take(&mut self.held);
        let normalized = normalize(self.mode.unwrap_or(NewlineMode::Plain), &held);
        self.buffer.push_str(&normalized);

        let mut frames = self.drain_frames();
        let rest = std::mem::take(&mut self.buffer);
        if let Some(frame) = parse_block(rest.trim_end_matches('\n')) {
            frames.push(frame);
        }
        frames
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> String {
        self.partial_utf8.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            let (valid, invalid_len) = match std::str::from_utf8(&self.partial_utf8) {
                Ok(_) => (self.partial_utf8.len(), None),
                Err(e) => (e.valid_up_to(), e.error_len()),
            };
            out.push_str(&String::from_utf8_lossy(&self.partial_utf8[..valid]));
            match invalid_len {
                Some(len) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.partial_utf8.drain(..valid + len);
                }
                None => {
                    self.partial_utf8.drain(..valid);
                    break;
                }
            }
        }
        out
    }

    fn push_text(&mut self, text: &str) {
        let mode = self.mode.unwrap_or(NewlineMode::Plain);
        let mut combined = std::mem::take(&mut self.held);
        combined.push_str(text);

        let held_len = held_suffix_len(&combined, terminator_patterns(mode));
        let split = combined.len() - held_len;
        self.held = combined[split..].to_string();
        self.buffer.push_str(&normalize(mode, &combined[..split]));
    }

    fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block[..end]) {
                trace!(target: "tether::stream", "Frame: event={} bytes={}", frame.event, frame.data.len());
                frames.push(frame);
            }
        }
        frames
    }
}

fn terminator_patterns(mode: NewlineMode) -> &'static [&'static str] {
    match mode {
        NewlineMode::Plain => &["\r\n"],
        NewlineMode::Escaped => &["\\r\\n", "\\n", "\r\n"],
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of one of
/// `patterns`.
fn held_suffix_len(text: &str, patterns: &[&str]) -> usize {
    let longest = patterns.iter().map(|p| p.len()).max().unwrap_or(0);
    for len in (1..longest).rev() {
        if len > text.len() || !text.is_char_boundary(text.len() - len) {
            continue;
        }
        let suffix = &text[text.len() - len..];
        if patterns.iter().any(|p| p.len() > len && p.starts_with(suffix)) {
            return len;
        }
    }
    0
}

fn normalize(mode: NewlineMode, text: &str) -> String {
    match mode {
        NewlineMode::Plain => text.replace("\r\n", "\n"),
        NewlineMode::Escaped => text
            .replace("\\r\\n", "\n")
            .replace("\r\n", "\n")
            .replace("\\n", "\n"),
    }
}

fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let value = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Parse the lines of one frame.
///
/// A line without a recognised field tag that follows a `data:` line is
/// treated as a continuation of that data.
fn parse_block(block: &str) -> Option<Frame> {
    let mut event: Option<String> = None;
    let mut data: Vec<String> = Vec::new();
    let mut in_data = false;

    for line in block.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(':') {
            in_data = false;
            continue;
        }
        if let Some(value) = field_value(line, "event") {
            event = Some(value.trim().to_string());
            in_data = false;
        } else if let Some(value) = field_value(line, "data") {
            data.push(value.to_string());
            in_data = true;
        } else if field_value(line, "id").is_some() || field_value(line, "retry").is_some() {
            in_data = false;
        } else if in_data {
            if let Some(last) = data.last_mut() {
                last.push('\n');
                last.push_str(line);
            }
        } else {
            trace!(target: "tether::stream", "Ignoring stray line outside data: {} bytes", line.len());
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(Frame {
        event: event
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
        data: data.join("\n"),
    })
}

/// Lazily decode frames from a chunk stream.
///
/// The returned stream is finite and not restartable. A transport error is
/// yielded once and ends the stream; whatever partial frame was buffered at
/// that point is discarded.
pub fn read_frames(chunks: ByteStream) -> FrameStream {
    struct ReaderState {
        chunks: ByteStream,
        decoder: FrameDecoder,
        ready: VecDeque<Frame>,
        finished: bool,
    }

    let state = ReaderState {
        chunks,
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.ready.pop_front() {
                return Some((Ok(frame), st));
            }
            if st.finished {
                return None;
            }
            match st.chunks.next().await {
                Some(Ok(chunk)) => {
                    let frames = st.decoder.feed(&chunk);
                    st.ready.extend(frames);
                }
                Some(Err(e)) => {
                    debug!(target: "tether::stream", "Stream failed, discarding partial frame: {}", e);
                    st.finished = true;
                    st.decoder = FrameDecoder::new();
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = true;
                    let decoder = std::mem::take(&mut st.decoder);
                    st.ready.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}

/// Build a [`ByteStream`] from in-memory chunks.
pub fn byte_stream_from_chunks<I, C>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = C>,
    I::IntoIter: Send + 'static,
    C: Into<Vec<u8>>,
{
    stream::iter(chunks.into_iter().map(|c| Ok::<_, TetherError>(c.into()))).boxed()
}
