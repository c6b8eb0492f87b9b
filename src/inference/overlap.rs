//! Overlap between a new request and the tokens already resident in a cache.

use crate::inference::engine::Token;

/// Reusable run of an old history.
///
/// `history[offset..offset + len]` equals `request[..len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overlap {
    pub len: usize,
    pub offset: usize,
}

impl Overlap {
    /// One past the last retained history position.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Finds the longest prefix of `request` that occurs anywhere in `history`,
/// preferring the earliest occurrence. Returns `Overlap { len: 0, offset: 0 }`
/// when nothing is shared.
///
/// Knuth-Morris-Pratt scan of `history` with `request` as the pattern: linear in
/// `request.len() + history.len()`.
pub fn find(request: &[Token], history: &[Token]) -> Overlap {
    if request.is_empty() || history.is_empty() {
        return Overlap::default();
    }

    let fail = failure_table(request);
    let mut best = Overlap::default();
    let mut matched = 0;

    for (i, token) in history.iter().enumerate() {
        while matched > 0 && request[matched] != *token {
            matched = fail[matched - 1];
        }
        if request[matched] == *token {
            matched += 1;
        }
        // Only a strictly longer match moves `best`, keeping the earliest window.
        if matched > best.len {
            best = Overlap {
                len: matched,
                offset: i + 1 - matched,
            };
        }
        if matched == request.len() {
            break;
        }
    }

    best
}

/// `fail[i]` is the length of the longest proper prefix of `pattern[..=i]` that
/// is also its suffix.
fn failure_table(pattern: &[Token]) -> Vec<usize> {
    let mut fail = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = fail[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        fail[i] = k;
    }
    fail
}
