//! Bounded line reader.
//!
//! Reads a source in fixed-size chunks and yields at most `max_lines`
//! records, each cut to `max_line_chars` characters. Memory held by a reader
//! is one chunk plus one capped line buffer, regardless of input size.

use std::io::SeekFrom;
use std::path::Path;

use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::config::StreamLimits;
use crate::error::StreamError;

/// Upper bound on UTF-8 bytes per character.
const MAX_UTF8_BYTES: usize = 4;

/// One emitted line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineRecord {
    pub text: String,
    /// The line was longer than `max_line_chars` and has been cut.
    pub truncated: bool,
}

/// Position and outcome of a single read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCursor {
    /// Byte offset just past the last emitted line. A fresh read started at
    /// this offset picks up with the next line.
    pub offset: u64,
    /// Records emitted so far.
    pub lines_emitted: usize,
    /// At least one emitted record was truncated.
    pub truncated: bool,
    /// Reading stopped at `max_lines` with input remaining.
    pub partial: bool,
}

/// Forward-only reader over an async byte source.
pub struct BoundedLineReader<R> {
    source: R,
    limits: StreamLimits,
    chunk: Box<[u8]>,
    pos: usize,
    filled: usize,
    line: Vec<u8>,
    line_cap: usize,
    line_overflow: bool,
    /// Bytes consumed from the source since the read started.
    consumed: u64,
    start_offset: u64,
    cursor: StreamCursor,
    eof: bool,
    done: bool,
}

/// Read lines from `source` with the default chunk size.
pub fn read_lines<R: AsyncRead + Unpin>(
    source: R,
    max_lines: usize,
    max_line_chars: usize,
) -> Result<BoundedLineReader<R>, StreamError> {
    BoundedLineReader::new(
        source,
        StreamLimits {
            max_lines,
            max_line_chars,
            ..StreamLimits::default()
        },
    )
}

impl BoundedLineReader<tokio::fs::File> {
    /// Open a file for a bounded read from its beginning.
    pub async fn open(path: impl AsRef<Path>, limits: StreamLimits) -> Result<Self, StreamError> {
        Self::open_at(path, 0, limits).await
    }

    /// Open a file and start reading at `offset`, typically a previously
    /// persisted [`StreamCursor::offset`].
    pub async fn open_at(
        path: impl AsRef<Path>,
        offset: u64,
        limits: StreamLimits,
    ) -> Result<Self, StreamError> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let mut reader = Self::new(file, limits)?;
        reader.start_offset = offset;
        reader.cursor.offset = offset;
        Ok(reader)
    }
}

impl<R: AsyncRead + Unpin> BoundedLineReader<R> {
    pub fn new(source: R, limits: StreamLimits) -> Result<Self, StreamError> {
        if limits.chunk_bytes == 0 {
            return Err(StreamError::InvalidLimits("chunk_bytes must be non-zero".into()));
        }
        if limits.max_line_chars == 0 {
            return Err(StreamError::InvalidLimits(
                "max_line_chars must be non-zero".into(),
            ));
        }
        let line_cap = limits.max_line_chars.saturating_mul(MAX_UTF8_BYTES);
        Ok(Self {
            source,
            limits,
            chunk: vec![0u8; limits.chunk_bytes].into_boxed_slice(),
            pos: 0,
            filled: 0,
            line: Vec::with_capacity(line_cap),
            line_cap,
            line_overflow: false,
            consumed: 0,
            start_offset: 0,
            cursor: StreamCursor::default(),
            eof: false,
            done: false,
        })
    }

    /// Current cursor.
    pub fn cursor(&self) -> StreamCursor {
        self.cursor
    }

    /// Bytes held by the reader's buffers. Constant for the reader's lifetime.
    pub fn buffered_bytes(&self) -> usize {
        self.chunk.len() + self.line.capacity()
    }

    /// Next record, or `None` once the source is exhausted or `max_lines` hit.
    pub async fn next_line(&mut self) -> Result<Option<LineRecord>, StreamError> {
        if self.done {
            return Ok(None);
        }
        if self.cursor.lines_emitted >= self.limits.max_lines {
            self.finish_at_limit().await?;
            return Ok(None);
        }

        loop {
            if self.pos == self.filled {
                if self.eof {
                    self.done = true;
                    if self.line.is_empty() && !self.line_overflow {
                        return Ok(None);
                    }
                    return Ok(Some(self.emit(false)));
                }
                self.fill().await?;
                continue;
            }

            let window = &self.chunk[self.pos..self.filled];
            match window.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.push_bytes(self.pos, self.pos + i);
                    self.pos += i + 1;
                    self.consumed += (i + 1) as u64;
                    let record = self.emit(true);
                    if self.cursor.lines_emitted >= self.limits.max_lines {
                        self.finish_at_limit().await?;
                    }
                    return Ok(Some(record));
                }
                None => {
                    let len = window.len();
                    self.push_bytes(self.pos, self.filled);
                    self.pos = self.filled;
                    self.consumed += len as u64;
                }
            }
        }
    }

    /// Lazily yield records. The reader (and its cursor) stays usable after
    /// the stream is dropped.
    pub fn records(&mut self) -> impl Stream<Item = Result<LineRecord, StreamError>> + '_ {
        futures::stream::unfold(self, |reader| async move {
            match reader.next_line().await {
                Ok(Some(record)) => Some((Ok(record), reader)),
                Ok(None) => None,
                Err(e) => {
                    reader.done = true;
                    Some((Err(e), reader))
                }
            }
        })
    }

    async fn fill(&mut self) -> Result<(), StreamError> {
        let n = self.source.read(&mut self.chunk[..]).await?;
        self.pos = 0;
        self.filled = n;
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn push_bytes(&mut self, from: usize, to: usize) {
        if self.line_overflow {
            return;
        }
        let room = self.line_cap - self.line.len();
        let bytes = &self.chunk[from..to];
        if bytes.len() > room {
            self.line.extend_from_slice(&bytes[..room]);
            self.line_overflow = true;
        } else {
            self.line.extend_from_slice(bytes);
        }
    }

    fn emit(&mut self, terminated: bool) -> LineRecord {
        if terminated && !self.line_overflow && self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        let mut text = String::from_utf8_lossy(&self.line).into_owned();
        let mut truncated = self.line_overflow;
        if let Some((cut, _)) = text.char_indices().nth(self.limits.max_line_chars) {
            text.truncate(cut);
            truncated = true;
        }

        self.line.clear();
        self.line_overflow = false;
        self.cursor.lines_emitted += 1;
        self.cursor.truncated |= truncated;
        self.cursor.offset = self.start_offset + self.consumed;

        LineRecord { text, truncated }
    }

    /// Stop at the line cap, recording whether any input was left unread.
    async fn finish_at_limit(&mut self) -> Result<(), StreamError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if self.pos < self.filled {
            self.cursor.partial = true;
        } else if !self.eof {
            self.fill().await?;
            self.cursor.partial = self.filled > 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::StreamExt;
    use tokio::io::ReadBuf;

    use super::*;

    fn limits(max_lines: usize, max_line_chars: usize, chunk_bytes: usize) -> StreamLimits {
        StreamLimits {
            max_lines,
            max_line_chars,
            chunk_bytes,
        }
    }

    async fn collect(input: &[u8], l: StreamLimits) -> (Vec<LineRecord>, StreamCursor) {
        let mut reader = BoundedLineReader::new(input, l).unwrap();
        let records: Vec<_> = reader
            .records()
            .map(|r| r.unwrap())
            .collect()
            .await;
        (records, reader.cursor())
    }

    /// Synthetic source producing `lines` copies of `line` without
    /// materialising the whole input.
    struct RepeatLines {
        line: Vec<u8>,
        lines_left: usize,
        pos: usize,
    }

    impl AsyncRead for RepeatLines {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            while buf.remaining() > 0 && self.lines_left > 0 {
                let start = self.pos;
                let n = (self.line.len() - start).min(buf.remaining());
                let end = start + n;
                buf.put_slice(&self.line[start..end]);
                self.pos = end;
                if self.pos == self.line.len() {
                    self.pos = 0;
                    self.lines_left -= 1;
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reads_all_lines_under_limits() {
        let (records, cursor) = collect(b"alpha\nbeta\r\ngamma", limits(10, 80, 4)).await;
        let texts: Vec<_> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["alpha", "beta", "gamma"]);
        assert!(records.iter().all(|r| !r.truncated));
        assert_eq!(cursor.lines_emitted, 3);
        assert!(!cursor.partial);
        assert!(!cursor.truncated);
        assert_eq!(cursor.offset, 17);
    }

    #[tokio::test]
    async fn long_line_is_cut_and_reading_continues() {
        let input = format!("{}\nshort\n", "x".repeat(500));
        let (records, cursor) = collect(input.as_bytes(), limits(10, 100, 64)).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text.len(), 100);
        assert!(records[0].truncated);
        assert_eq!(records[1].text, "short");
        assert!(!records[1].truncated);
        assert!(cursor.truncated);
    }

    #[tokio::test]
    async fn multibyte_lines_are_cut_on_char_boundaries() {
        let input = "ééééé\n".as_bytes();
        let (records, _) = collect(input, limits(10, 3, 2)).await;
        assert_eq!(records[0].text, "ééé");
        assert!(records[0].truncated);
    }

    #[tokio::test]
    async fn stops_at_max_lines_with_partial_flag() {
        let input: String = (0..10_000).map(|i| format!("line {i}\n")).collect();
        let (records, cursor) = collect(input.as_bytes(), limits(2_000, 200, 64 * 1024)).await;
        assert_eq!(records.len(), 2_000);
        assert_eq!(records[1_999].text, "line 1999");
        assert_eq!(cursor.lines_emitted, 2_000);
        assert!(cursor.partial);
    }

    #[tokio::test]
    async fn exact_line_count_is_not_partial() {
        let (records, cursor) = collect(b"a\nb\n", limits(2, 10, 1)).await;
        assert_eq!(records.len(), 2);
        assert!(!cursor.partial);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let (records, cursor) = collect(b"", limits(5, 5, 8)).await;
        assert!(records.is_empty());
        assert_eq!(cursor, StreamCursor::default());
    }

    #[tokio::test]
    async fn blank_lines_are_records() {
        let (records, _) = collect(b"\n\nx\n", limits(10, 10, 3)).await;
        let texts: Vec<_> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["", "", "x"]);
    }

    #[tokio::test]
    async fn memory_stays_fixed_for_large_input() {
        // ~50 MB of input, including lines far longer than the cap.
        let mut line = "y".repeat(5_000).into_bytes();
        line.push(b'\n');
        let source = RepeatLines {
            line,
            lines_left: 10_000,
            pos: 0,
        };
        let l = limits(usize::MAX, 1_000, 64 * 1024);
        let mut reader = BoundedLineReader::new(source, l).unwrap();
        let fixed = reader.buffered_bytes();
        assert_eq!(fixed, 64 * 1024 + 4_000);

        let mut peak = fixed;
        let mut count = 0;
        while let Some(record) = reader.next_line().await.unwrap() {
            assert!(record.text.chars().count() <= 1_000);
            peak = peak.max(reader.buffered_bytes());
            count += 1;
        }
        assert_eq!(count, 10_000);
        assert_eq!(peak, fixed);
    }

    #[tokio::test]
    async fn resume_from_persisted_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        tokio::fs::write(&path, "one\ntwo\nthree\nfour\n").await.unwrap();

        let mut first = BoundedLineReader::open(&path, limits(2, 10, 4)).await.unwrap();
        while first.next_line().await.unwrap().is_some() {}
        let cursor = first.cursor();
        assert!(cursor.partial);
        assert_eq!(cursor.offset, 8);

        let mut second = BoundedLineReader::open_at(&path, cursor.offset, limits(10, 10, 4))
            .await
            .unwrap();
        let mut rest = Vec::new();
        while let Some(record) = second.next_line().await.unwrap() {
            rest.push(record.text);
        }
        assert_eq!(rest, vec!["three", "four"]);
        assert_eq!(second.cursor().offset, 19);
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let result = BoundedLineReader::new(&b""[..], limits(1, 1, 0));
        assert!(matches!(result, Err(StreamError::InvalidLimits(_))));
    }
}
