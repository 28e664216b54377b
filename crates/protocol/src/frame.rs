/// One newline-delimited line of a response stream.
///
/// A frame is always a whole line: it never contains a delimiter and is never
/// split across decoder calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub(crate) fn new(line: String) -> Self {
        Self(line)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Splits raw transport bytes into newline-delimited frames.
///
/// Bytes after the last delimiter stay buffered until a later `feed` call
/// completes the line, so chunk boundaries never change the emitted frame
/// sequence. No frame-size limit is enforced: a stream that never sends `\n`
/// grows the buffer without bound.
#[derive(Debug, Default)]
pub struct LineFrameDecoder {
    buffer: Vec<u8>,
}

impl LineFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one byte chunk and returns every frame it completes.
    ///
    /// Completed lines decode as UTF-8 with replacement characters for
    /// malformed sequences; decoding cannot fail. Zero-length lines are
    /// dropped, never surfaced.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();

            if line.is_empty() {
                continue;
            }

            frames.push(Frame::new(String::from_utf8_lossy(&line).into_owned()));
        }

        frames
    }

    /// Ends the stream.
    ///
    /// A trailing line the server never terminated with `\n` is discarded
    /// rather than surfaced: no newline, no frame.
    pub fn flush(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            tracing::debug!(
                discarded_bytes = self.buffer.len(),
                "discarding unterminated bytes at stream end"
            );
            self.buffer.clear();
        }

        None
    }
}
