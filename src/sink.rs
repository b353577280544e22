//! Fence-stripping stream sink.
//!
//! Completion responses frequently arrive wrapped in a markdown code fence:
//!
//! ~~~text
//! ```html
//! <p>hi</p>
//! ```
//! ~~~
//!
//! [`FenceStripper`] removes the opening fence line and the closing
//! backticks from a fragment stream while emitting everything else as early
//! as it safely can. [`FenceSink`] drives a stripper over an async fragment
//! stream and writes the sanitized text to a destination.
//!
//! The first [`HEAD_THRESHOLD`] characters are held until the opening fence
//! can be decided. The last [`TAIL_WINDOW`] characters are always held back
//! so the closing fence can be recognised at end of stream. Because the
//! decision points depend only on character counts, the output is the same
//! for every fragmentation of a response whose opening fence line fits in
//! the head.

use crate::error::{Error, Result};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::trace;

/// Characters buffered before deciding whether the response opens with a fence.
pub const HEAD_THRESHOLD: usize = 100;

/// Characters held back at the end so a closing fence can be dropped.
pub const TAIL_WINDOW: usize = 10;

const FENCE: &str = "```";
const CLOSING_FENCE: &str = "\n```";

/// Byte length of a leading fence line (backticks, optional language tag,
/// newline), if `text` opens with one.
fn opening_fence_len(text: &str) -> Option<usize> {
    let rest = text.strip_prefix(FENCE)?;
    let newline = rest.find('\n')?;
    let tag = &rest[..newline];

    tag.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '#' | '.' | '-'))
        .then_some(FENCE.len() + newline + 1)
}

/// Incremental fence remover.
///
/// Feed fragments with [`push`](Self::push) and call
/// [`finish`](Self::finish) once the stream ends. Text ready to be written
/// is appended to the caller's buffer.
#[derive(Debug, Default)]
pub struct FenceStripper {
    head: String,
    head_chars: usize,
    head_resolved: bool,
    tail: String,
    tail_chars: usize,
    stripped_opening: bool,
    stripped_closing: bool,
}

impl FenceStripper {
    /// Creates a stripper in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one fragment, appending releasable text to `out`.
    pub fn push(&mut self, fragment: &str, out: &mut String) {
        if fragment.is_empty() {
            return;
        }

        if self.head_resolved {
            self.push_tail(fragment, out);
            return;
        }

        self.head.push_str(fragment);
        self.head_chars += fragment.chars().count();

        if self.head_chars >= HEAD_THRESHOLD {
            self.resolve_head(out);
        }
    }

    /// Flushes everything still held, dropping a closing fence if present.
    pub fn finish(&mut self, out: &mut String) {
        if !self.head_resolved {
            self.resolve_head(out);
        }

        if self.tail.ends_with(CLOSING_FENCE) {
            // Keep the newline in front of the backticks.
            self.tail.truncate(self.tail.len() - 3);
            self.stripped_closing = true;
        }

        out.push_str(&self.tail);
        self.tail.clear();
        self.tail_chars = 0;
    }

    /// True once a leading fence line has been removed.
    #[must_use]
    pub const fn stripped_opening(&self) -> bool {
        self.stripped_opening
    }

    /// True once trailing fence backticks have been removed.
    #[must_use]
    pub const fn stripped_closing(&self) -> bool {
        self.stripped_closing
    }

    fn resolve_head(&mut self, out: &mut String) {
        self.head_resolved = true;
        let head = std::mem::take(&mut self.head);
        self.head_chars = 0;

        let body = match opening_fence_len(&head) {
            Some(len) => {
                trace!("Stripping opening fence {:?}", &head[..len]);
                self.stripped_opening = true;
                &head[len..]
            }
            None => head.as_str(),
        };

        self.push_tail(body, out);
    }

    fn push_tail(&mut self, text: &str, out: &mut String) {
        if text.is_empty() {
            return;
        }

        self.tail.push_str(text);
        self.tail_chars += text.chars().count();

        if self.tail_chars > TAIL_WINDOW {
            let excess = self.tail_chars - TAIL_WINDOW;
            let split = self
                .tail
                .char_indices()
                .nth(excess)
                .map_or(self.tail.len(), |(idx, _)| idx);

            out.push_str(&self.tail[..split]);
            self.tail.drain(..split);
            self.tail_chars = TAIL_WINDOW;
        }
    }
}

/// What a [`FenceSink`] did with one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    /// Bytes written to the destination
    pub bytes_written: usize,

    /// Fragments received from the stream
    pub fragments: usize,

    /// Whether an opening fence line was removed
    pub stripped_opening: bool,

    /// Whether closing fence backticks were removed
    pub stripped_closing: bool,
}

/// Writes a fragment stream to a destination, minus code fences.
pub struct FenceSink<W> {
    writer: W,
    path: PathBuf,
    stripper: FenceStripper,
}

impl FenceSink<BufWriter<File>> {
    /// Opens `path` for writing, creating parent directories and truncating
    /// any previous content.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the file cannot be created.
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        let file = File::create(path).await.map_err(|e| Error::io(path, e))?;
        Ok(Self::new(BufWriter::new(file), path))
    }
}

impl<W> FenceSink<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wraps an existing writer; `path` is only used in error messages.
    pub fn new(writer: W, path: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            path: path.into(),
            stripper: FenceStripper::new(),
        }
    }

    /// Drains `stream` into the destination and closes it.
    ///
    /// On a stream error the text released so far is flushed and the error
    /// is returned; the destination keeps the partial output.
    ///
    /// # Errors
    ///
    /// Returns the first stream error, or an I/O error from the destination.
    pub async fn pipe<S>(mut self, mut stream: S) -> Result<SinkReport>
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        let mut report = SinkReport::default();
        let mut pending = String::new();

        while let Some(item) = stream.next().await {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.writer
                        .flush()
                        .await
                        .map_err(|io| Error::io(&self.path, io))?;
                    return Err(e);
                }
            };

            report.fragments += 1;
            self.stripper.push(&fragment, &mut pending);
            self.write_pending(&mut pending, &mut report).await?;
        }

        self.stripper.finish(&mut pending);
        self.write_pending(&mut pending, &mut report).await?;

        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::io(&self.path, e))?;

        report.stripped_opening = self.stripper.stripped_opening();
        report.stripped_closing = self.stripper.stripped_closing();
        Ok(report)
    }

    async fn write_pending(&mut self, pending: &mut String, report: &mut SinkReport) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        self.writer
            .write_all(pending.as_bytes())
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        report.bytes_written += pending.len();
        pending.clear();
        Ok(())
    }
}
