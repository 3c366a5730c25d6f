//! Line-oriented capture of a worker's stdout and stderr.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// One line of worker output with its position in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    text: Arc<str>,
}

impl LogLine {
    pub fn new(seq: u64, text: impl Into<Arc<str>>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Result of one bounded read from [`WorkerOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(LogLine),
    /// Nothing arrived within the wait; the stream is still open.
    Idle,
    /// The worker closed its output. Returned exactly once.
    EndOfStream,
    /// Every read after [`ReadOutcome::EndOfStream`].
    Exhausted,
}

type ByteLines = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

/// The worker's merged output, read one line at a time.
///
/// Owned by exactly one reader (the drain loop). Sequence numbers start at
/// 1 and increase by one per line.
pub struct WorkerOutput {
    lines: ByteLines,
    next_seq: u64,
    ended: bool,
}

impl std::fmt::Debug for WorkerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOutput")
            .field("next_seq", &self.next_seq)
            .field("ended", &self.ended)
            .finish()
    }
}

impl WorkerOutput {
    /// Capture a single reader.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::from_lines(Box::pin(split_lines(reader)))
    }

    /// Capture two readers (typically stdout and stderr) as one sequence.
    /// Lines from the same reader keep their relative order.
    pub fn merged<A, B>(primary: A, secondary: B) -> Self
    where
        A: AsyncRead + Unpin + Send + 'static,
        B: AsyncRead + Unpin + Send + 'static,
    {
        Self::from_lines(Box::pin(split_lines(primary).merge(split_lines(secondary))))
    }

    fn from_lines(lines: ByteLines) -> Self {
        Self {
            lines,
            next_seq: 1,
            ended: false,
        }
    }

    /// Wait up to `wait` for the next line.
    ///
    /// Cancel-safe: dropping the future loses no partially read line.
    pub async fn read_line(&mut self, wait: Duration) -> ReadOutcome {
        if self.ended {
            return ReadOutcome::Exhausted;
        }

        match tokio::time::timeout(wait, self.lines.next()).await {
            Err(_elapsed) => ReadOutcome::Idle,
            Ok(Some(Ok(bytes))) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                ReadOutcome::Line(LogLine::new(seq, decode_line(bytes)))
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "error reading worker output; treating as end of stream");
                self.ended = true;
                ReadOutcome::EndOfStream
            }
            Ok(None) => {
                self.ended = true;
                ReadOutcome::EndOfStream
            }
        }
    }

    /// Number of lines handed out so far.
    pub fn lines_read(&self) -> u64 {
        self.next_seq - 1
    }
}

fn split_lines<R>(reader: R) -> SplitStream<BufReader<R>>
where
    R: AsyncRead + Unpin,
{
    SplitStream::new(BufReader::new(reader).split(b'\n'))
}

/// Strip a trailing `\r` and decode, replacing invalid UTF-8.
fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    async fn collect(output: &mut WorkerOutput) -> Vec<LogLine> {
        let mut lines = Vec::new();
        loop {
            match output.read_line(WAIT).await {
                ReadOutcome::Line(line) => lines.push(line),
                ReadOutcome::Idle => continue,
                ReadOutcome::EndOfStream | ReadOutcome::Exhausted => return lines,
            }
        }
    }

    #[tokio::test]
    async fn yields_lines_in_order_with_increasing_seq() {
        let mut output = WorkerOutput::from_reader(&b"a\nb\nc\n"[..]);
        let lines = collect(&mut output).await;

        let texts: Vec<&str> = lines.iter().map(|l| l.text()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        let seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(output.lines_read(), 3);
    }

    #[tokio::test]
    async fn end_of_stream_is_reported_once() {
        let mut output = WorkerOutput::from_reader(&b"only\n"[..]);
        assert!(matches!(output.read_line(WAIT).await, ReadOutcome::Line(_)));
        assert_eq!(output.read_line(WAIT).await, ReadOutcome::EndOfStream);
        assert_eq!(output.read_line(WAIT).await, ReadOutcome::Exhausted);
        assert_eq!(output.read_line(WAIT).await, ReadOutcome::Exhausted);
    }

    #[tokio::test]
    async fn final_line_without_newline_is_kept() {
        let mut output = WorkerOutput::from_reader(&b"first\r\nlast"[..]);
        let lines = collect(&mut output).await;
        let texts: Vec<&str> = lines.iter().map(|l| l.text()).collect();
        assert_eq!(texts, vec!["first", "last"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_dropped() {
        let mut output = WorkerOutput::from_reader(&b"ok \xff\n"[..]);
        let lines = collect(&mut output).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text().starts_with("ok "));
    }

    #[tokio::test]
    async fn idle_when_no_output_is_available() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut output = WorkerOutput::from_reader(reader);
        assert_eq!(
            output.read_line(Duration::from_millis(20)).await,
            ReadOutcome::Idle
        );
    }

    #[tokio::test]
    async fn merged_readers_keep_per_source_order() {
        let mut output = WorkerOutput::merged(&b"o1\no2\n"[..], &b"e1\ne2\n"[..]);
        let lines = collect(&mut output).await;

        let texts: Vec<&str> = lines.iter().map(|l| l.text()).collect();
        assert_eq!(texts.len(), 4);
        let pos = |t: &str| texts.iter().position(|x| *x == t).unwrap();
        assert!(pos("o1") < pos("o2"));
        assert!(pos("e1") < pos("e2"));

        let seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
