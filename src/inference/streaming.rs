//! Streaming inference support
//!
//! Turns the token-level [`Stream`] into text chunks, honouring the
//! `n_predict` budget and never splitting a UTF-8 sequence across chunks.

use crate::inference::engine::Engine;
use crate::inference::error::InferenceError;
use crate::inference::model::Model;
use crate::inference::stream::Stream;

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated token string
    Token(String),
    /// Generation completed successfully
    Done,
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// Text view over a [`Stream`].
///
/// Yields [`StreamToken::Token`] chunks, then exactly one [`StreamToken::Done`]
/// or [`StreamToken::Error`], then `None`.
pub struct TextStream<'m, E: Engine> {
    model: &'m Model<E>,
    stream: Stream<E::Context>,
    limit: Option<usize>,
    generated: usize,
    pending: Vec<u8>,
    queued: Option<StreamToken>,
    finished: bool,
}

impl<'m, E: Engine> TextStream<'m, E> {
    pub(crate) fn new(model: &'m Model<E>, stream: Stream<E::Context>, limit: Option<usize>) -> Self {
        Self {
            model,
            stream,
            limit,
            generated: 0,
            pending: Vec::new(),
            queued: None,
            finished: false,
        }
    }

    /// Tokens generated so far.
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Seed resolved for this prediction.
    pub fn seed(&self) -> u32 {
        self.stream.seed()
    }

    /// Returns the session to the model's pool.
    pub fn close(self) {
        self.stream.close();
    }

    /// Gives back the token-level stream, discarding any buffered bytes.
    pub fn into_inner(self) -> Stream<E::Context> {
        self.stream
    }

    /// Ends the stream with `last`, emitting buffered bytes first.
    fn finish(&mut self, last: StreamToken) -> StreamToken {
        self.finished = true;
        if self.pending.is_empty() {
            return last;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.queued = Some(last);
        StreamToken::Token(rest)
    }

    /// Removes and returns the longest valid UTF-8 prefix of `pending`.
    fn take_complete(&mut self) -> Option<String> {
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Bytes that can never become valid are passed through lossily.
            Err(e) if e.error_len().is_some() => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Some(text);
            }
            Err(e) => e.valid_up_to(),
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let bytes = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(bytes).ok()
    }
}

impl<E: Engine> Iterator for TextStream<'_, E> {
    type Item = StreamToken;

    fn next(&mut self) -> Option<StreamToken> {
        if let Some(token) = self.queued.take() {
            return Some(token);
        }
        if self.finished {
            return None;
        }

        loop {
            if self.limit.is_some_and(|limit| self.generated >= limit) {
                tracing::debug!(generated = self.generated, "prediction limit reached");
                return Some(self.finish(StreamToken::Done));
            }

            let token = match self.stream.next(&[]) {
                Ok(token) => token,
                Err(InferenceError::EndOfStream) => return Some(self.finish(StreamToken::Done)),
                Err(InferenceError::ContextFull) => {
                    tracing::warn!(generated = self.generated, "context full, stopping generation");
                    return Some(self.finish(StreamToken::Done));
                }
                Err(e) => {
                    tracing::error!("generation failed: {}", e);
                    return Some(self.finish(StreamToken::Error(e.to_string())));
                }
            };
            self.generated += 1;

            match self.model.engine().token_to_piece(token) {
                Ok(piece) => self.pending.extend_from_slice(&piece),
                Err(e) => {
                    tracing::error!("failed to detokenize {}: {}", token, e);
                    return Some(self.finish(StreamToken::Error(e.to_string())));
                }
            }
            if let Some(text) = self.take_complete() {
                return Some(StreamToken::Token(text));
            }
        }
    }
}
