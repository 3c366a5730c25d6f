//! The drain loop: sole reader of a worker's output.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::LogBroadcaster;
use crate::worker::{ReadOutcome, WorkerOutput};

/// What a drain loop saw before it finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub lines: u64,
    /// The worker closed its output (as opposed to the loop being cancelled
    /// while the pipe was still open).
    pub reached_eof: bool,
}

/// Read `output` until it ends or `cancel` fires, publishing every line to
/// `broadcaster`, then close the broadcaster.
///
/// Each read waits at most `poll_interval`, so cancellation is observed
/// within one interval. After cancellation, lines that are already
/// available are still flushed for at most one more interval.
pub async fn drain_output(
    mut output: WorkerOutput,
    broadcaster: LogBroadcaster,
    cancel: CancellationToken,
    poll_interval: Duration,
) -> DrainSummary {
    let mut summary = DrainSummary::default();

    while !cancel.is_cancelled() {
        match output.read_line(poll_interval).await {
            ReadOutcome::Line(line) => {
                trace!(seq = line.seq, text = line.text(), "worker output");
                broadcaster.publish(line);
                summary.lines += 1;
            }
            ReadOutcome::Idle => {}
            ReadOutcome::EndOfStream | ReadOutcome::Exhausted => {
                summary.reached_eof = true;
                break;
            }
        }
    }

    if !summary.reached_eof {
        let deadline = Instant::now() + poll_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match output.read_line(remaining).await {
                ReadOutcome::Line(line) => {
                    broadcaster.publish(line);
                    summary.lines += 1;
                }
                ReadOutcome::Idle => break,
                ReadOutcome::EndOfStream | ReadOutcome::Exhausted => {
                    summary.reached_eof = true;
                    break;
                }
            }
        }
    }

    broadcaster.close();
    debug!(
        lines = summary.lines,
        reached_eof = summary.reached_eof,
        "drain loop finished"
    );
    summary
}
