//! Delimited-block extraction over a text stream.
//!
//! Model output arrives in arbitrary fragments. [`MetadataExtractor`] splits
//! it into narrative text and the contents of `start … end` blocks, holding
//! back any tail that could be the beginning of a delimiter so that the
//! result does not depend on where the fragments were cut.

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractChunk {
    /// Text outside any block.
    Text(String),
    /// The contents of one block, delimiters removed.
    Match(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    InBlock,
}

/// Push-style extractor. Feed fragments with [`push`](Self::push) and call
/// [`finish`](Self::finish) once the input ends.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    start: String,
    end: String,
    state: State,
    buffer: String,
}

impl MetadataExtractor {
    /// An extractor for `start … end` blocks. If either delimiter is empty
    /// the extractor passes all input through as text.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            state: State::Outside,
            buffer: String::new(),
        }
    }

    fn passthrough(&self) -> bool {
        self.start.is_empty() || self.end.is_empty()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<ExtractChunk> {
        if self.passthrough() {
            return if fragment.is_empty() {
                Vec::new()
            } else {
                vec![ExtractChunk::Text(fragment.to_string())]
            };
        }

        self.buffer.push_str(fragment);
        let mut out = Vec::new();
        loop {
            match self.state {
                State::Outside => {
                    if let Some(at) = self.buffer.find(&self.start) {
                        if at > 0 {
                            out.push(ExtractChunk::Text(self.buffer[..at].to_string()));
                        }
                        self.buffer.drain(..at + self.start.len());
                        self.state = State::InBlock;
                        continue;
                    }
                    let held = delimiter_prefix_len(&self.buffer, &self.start);
                    let ready = self.buffer.len() - held;
                    if ready > 0 {
                        out.push(ExtractChunk::Text(self.buffer[..ready].to_string()));
                        self.buffer.drain(..ready);
                    }
                    break;
                }
                State::InBlock => {
                    let Some(at) = self.buffer.find(&self.end) else { break };
                    out.push(ExtractChunk::Match(self.buffer[..at].to_string()));
                    self.buffer.drain(..at + self.end.len());
                    self.state = State::Outside;
                }
            }
        }
        out
    }

    /// Flush whatever is buffered. An unterminated block is emitted as a
    /// match.
    pub fn finish(&mut self) -> Vec<ExtractChunk> {
        let rest = std::mem::take(&mut self.buffer);
        let state = std::mem::replace(&mut self.state, State::Outside);
        if rest.is_empty() {
            return Vec::new();
        }
        match state {
            State::Outside => vec![ExtractChunk::Text(rest)],
            State::InBlock => vec![ExtractChunk::Match(rest)],
        }
    }

    /// Extract from a complete text in one call. Adjacent text pieces are
    /// merged, so the result has no two `Text` chunks in a row.
    pub fn extract_all(&mut self, text: &str) -> Vec<ExtractChunk> {
        let mut chunks = self.push(text);
        chunks.extend(self.finish());
        merge_text(chunks)
    }
}

/// Join runs of consecutive `Text` chunks.
fn merge_text(chunks: Vec<ExtractChunk>) -> Vec<ExtractChunk> {
    let mut out: Vec<ExtractChunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match (out.last_mut(), chunk) {
            (Some(ExtractChunk::Text(prev)), ExtractChunk::Text(next)) => prev.push_str(&next),
            (_, chunk) => out.push(chunk),
        }
    }
    out
}

/// Length of the longest proper prefix of `delimiter` that `buffer` ends with.
fn delimiter_prefix_len(buffer: &str, delimiter: &str) -> usize {
    let longest = delimiter.len().saturating_sub(1).min(buffer.len());
    (1..=longest)
        .rev()
        .find(|&k| delimiter.is_char_boundary(k) && buffer.ends_with(&delimiter[..k]))
        .unwrap_or(0)
}

/// Lazy adapter: extract blocks from a stream of text fragments.
///
/// Errors from the input are passed through in order; the extractor is
/// flushed when the input ends.
pub fn extract_stream<S, E>(
    input: S,
    start: impl Into<String>,
    end: impl Into<String>,
) -> impl Stream<Item = Result<ExtractChunk, E>>
where
    S: Stream<Item = Result<String, E>> + Unpin,
{
    let seed = (input, MetadataExtractor::new(start, end), VecDeque::new(), false);
    stream::unfold(seed, |(mut input, mut extractor, mut pending, mut done)| async move {
        loop {
            if let Some(chunk) = pending.pop_front() {
                return Some((Ok(chunk), (input, extractor, pending, done)));
            }
            if done {
                return None;
            }
            match input.next().await {
                Some(Ok(fragment)) => pending.extend(extractor.push(&fragment)),
                Some(Err(err)) => return Some((Err(err), (input, extractor, pending, done))),
                None => {
                    pending.extend(extractor.finish());
                    done = true;
                }
            }
        }
    })
}
