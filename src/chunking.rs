//! Sentence-aligned chunking of oversized inputs, sequential chunk
//! processing with retry, and merging of per-chunk results.

use std::future::Future;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventBus};
use crate::queue::RequestId;

/// Trailing sentences carried into the next chunk when overlap is enabled.
pub const OVERLAP_SENTENCES: usize = 3;

/// Words compared at each chunk boundary by the smart merge.
pub const SMART_MERGE_WINDOW: usize = 50;

/// Shortest word run treated as duplicated overlap by the smart merge.
pub const MIN_SMART_OVERLAP_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub estimated_tokens: usize,
    pub overlap_prefix_applied: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Blank line between chunk results.
    Sequential,
    /// Each chunk wrapped in explicit section markers.
    Preserve,
    /// Duplicated text at chunk boundaries removed before joining.
    #[default]
    Smart,
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Split on sentence-ending punctuation (`.`, `!`, `?`) followed by
/// whitespace or end of input. Closing quotes and brackets stay with the
/// sentence they end. Trailing text without punctuation is its own sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    const TERMINATORS: [char; 3] = ['.', '!', '?'];
    const CLOSERS: [char; 7] = ['"', '\'', ')', ']', '\u{201d}', '\u{2019}', '.'];

    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if !TERMINATORS.contains(&c) {
            continue;
        }
        while let Some(&next) = chars.peek() {
            if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                current.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek().is_none_or(|n| n.is_whitespace()) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Break a sentence that alone exceeds `max_tokens` into word-aligned pieces.
/// A single word over the bound is cut on char boundaries.
fn split_oversized(sentence: &str, max_tokens: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if estimate_tokens(word) > max_tokens {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.extend(split_chars(word, max_tokens * 4));
            continue;
        }
        if !current.is_empty() && estimate_tokens(&current) + estimate_tokens(word) + 1 > max_tokens
        {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn split_chars(word: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

fn joined_tokens(parts: &[String], extra: Option<&str>) -> usize {
    let mut chars: usize = parts.iter().map(|p| p.chars().count()).sum();
    let mut count = parts.len();
    if let Some(e) = extra {
        chars += e.chars().count();
        count += 1;
    }
    (chars + count.saturating_sub(1)).div_ceil(4)
}

/// Greedily pack sentences into chunks of at most `max_tokens` estimated tokens.
///
/// Sentences over the bound are split on words, and words over the bound on
/// chars, so every chunk respects `max_tokens`.
///
/// With `overlap > 0`, each new chunk opens with up to [`OVERLAP_SENTENCES`]
/// trailing sentences of the previous one, as many as fit in `overlap`
/// tokens. The seed is dropped if it would push the chunk over the bound.
pub fn split_into_chunks(text: &str, max_tokens: usize, overlap: usize) -> Vec<Chunk> {
    let max_tokens = max_tokens.max(1);

    let sentences: Vec<String> = split_sentences(text)
        .into_iter()
        .flat_map(|s| {
            if estimate_tokens(&s) > max_tokens {
                split_oversized(&s, max_tokens)
            } else {
                vec![s]
            }
        })
        .collect();

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut seeded = false;

    let close = |parts: &[String], seeded: bool, chunks: &mut Vec<Chunk>| {
        let text = parts.join(" ");
        chunks.push(Chunk {
            index: chunks.len(),
            estimated_tokens: estimate_tokens(&text),
            text,
            overlap_prefix_applied: seeded,
        });
    };

    for sentence in sentences {
        if !current.is_empty() && joined_tokens(&current, Some(&sentence)) > max_tokens {
            close(&current, seeded, &mut chunks);

            let mut seed = overlap_seed(&current, overlap);
            if !seed.is_empty() && joined_tokens(&seed, Some(&sentence)) > max_tokens {
                seed.clear();
            }
            seeded = !seed.is_empty();
            current = seed;
        }
        current.push(sentence);
    }

    if !current.is_empty() {
        close(&current, seeded, &mut chunks);
    }
    chunks
}

fn overlap_seed(previous: &[String], overlap: usize) -> Vec<String> {
    if overlap == 0 {
        return Vec::new();
    }
    let mut seed: Vec<String> = Vec::new();
    for sentence in previous.iter().rev().take(OVERLAP_SENTENCES) {
        let mut candidate = vec![sentence.clone()];
        candidate.extend(seed.iter().cloned());
        if joined_tokens(&candidate, None) > overlap {
            break;
        }
        seed = candidate;
    }
    seed
}

/// Retry and pacing knobs for [`process_chunks`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkRunOptions {
    /// Attempts per chunk, including the first.
    pub max_retries: u32,
    /// Base retry backoff (`delay * attempt`) and fixed pause between chunks.
    pub delay: Duration,
}

/// Bus that chunk progress goes to, tagged with the request it belongs to.
#[derive(Clone, Copy)]
pub struct ProgressSink<'a> {
    pub bus: &'a EventBus,
    pub id: Option<RequestId>,
}

impl<'a> ProgressSink<'a> {
    pub fn new(bus: &'a EventBus, id: Option<RequestId>) -> Self {
        Self { bus, id }
    }

    fn publish<T: Serialize>(&self, current: usize, total: usize, result: &T) {
        self.bus.publish(DispatchEvent::ChunkProgress {
            id: self.id,
            current,
            total,
            percentage: ((current * 100) / total.max(1)) as u8,
            result: serde_json::to_value(result).unwrap_or_default(),
        });
    }
}

/// Process chunks strictly in order.
///
/// A chunk is attempted up to `max_retries` times, sleeping
/// `delay * attempt` between attempts. A chunk that exhausts its attempts
/// aborts the run and earlier results are discarded. After each success a
/// progress event is published and, unless it was the last chunk, the run
/// pauses for `delay`.
pub async fn process_chunks<T, F, Fut>(
    chunks: &[Chunk],
    opts: ChunkRunOptions,
    progress: Option<ProgressSink<'_>>,
    mut process: F,
) -> Result<Vec<T>, DispatchError>
where
    T: Serialize,
    F: FnMut(&Chunk) -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let total = chunks.len();
    let attempts = opts.max_retries.max(1);
    let mut results = Vec::with_capacity(total);

    for chunk in chunks {
        let mut attempt = 1;
        let output = loop {
            match process(chunk).await {
                Ok(out) => break out,
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        chunk = chunk.index,
                        attempt,
                        "chunk failed, retrying: {e}"
                    );
                    tokio::time::sleep(opts.delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(chunk = chunk.index, attempts, "chunk exhausted retries: {e}");
                    return Err(DispatchError::ChunkProcessing {
                        index: chunk.index,
                        attempts,
                        source: Box::new(e),
                    });
                }
            }
        };
        if let Some(sink) = progress {
            sink.publish(results.len() + 1, total, &output);
        }
        results.push(output);

        let current = results.len();
        if current < total {
            tokio::time::sleep(opts.delay).await;
        }
    }

    Ok(results)
}

/// Split `text` and process the pieces in order. See [`process_chunks`].
pub async fn process_large_text<T, F, Fut>(
    text: &str,
    max_tokens: usize,
    overlap: usize,
    opts: ChunkRunOptions,
    progress: Option<ProgressSink<'_>>,
    process: F,
) -> Result<Vec<T>, DispatchError>
where
    T: Serialize,
    F: FnMut(&Chunk) -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let chunks = split_into_chunks(text, max_tokens, overlap);
    tracing::info!(chunks = chunks.len(), max_tokens, "processing text in chunks");
    process_chunks(&chunks, opts, progress, process).await
}

pub fn merge_chunks(results: &[String], strategy: MergeStrategy) -> String {
    match strategy {
        MergeStrategy::Sequential => results.join("\n\n"),
        MergeStrategy::Preserve => {
            let total = results.len();
            results
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let n = i + 1;
                    format!("--- Section {n} of {total} ---\n{r}\n--- End of Section {n} ---")
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        }
        MergeStrategy::Smart => {
            let mut merged: Vec<&str> = Vec::with_capacity(results.len());
            for (i, r) in results.iter().enumerate() {
                if i == 0 {
                    merged.push(r.as_str());
                    continue;
                }
                let skip = boundary_overlap(&results[i - 1], r);
                let rest = skip_words(r, skip);
                if !rest.is_empty() {
                    merged.push(rest);
                }
            }
            merged.join("\n\n")
        }
    }
}

/// Length of the longest run that ends `prev` and starts `next`, looking at
/// most [`SMART_MERGE_WINDOW`] words each side. Zero below the minimum run.
fn boundary_overlap(prev: &str, next: &str) -> usize {
    let prev_words: Vec<&str> = prev.split_whitespace().collect();
    let tail = &prev_words[prev_words.len().saturating_sub(SMART_MERGE_WINDOW)..];
    let head: Vec<&str> = next.split_whitespace().take(SMART_MERGE_WINDOW).collect();

    let longest = tail.len().min(head.len());
    (MIN_SMART_OVERLAP_WORDS..=longest)
        .rev()
        .find(|&k| tail[tail.len() - k..] == head[..k])
        .unwrap_or(0)
}

/// `text` with its first `n` whitespace-separated words removed, formatting kept.
fn skip_words(text: &str, n: usize) -> &str {
    if n == 0 {
        return text;
    }
    let mut rest = text.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        let s = split_sentences("One. Two!  Three? Four");
        assert_eq!(s, vec!["One.", "Two!", "Three?", "Four"]);
    }

    #[test]
    fn sentences_keep_closing_quotes_and_ellipses() {
        let s = split_sentences("He said \"stop.\" Then... nothing. v1.2 shipped.");
        assert_eq!(s, vec!["He said \"stop.\"", "Then...", "nothing.", "v1.2 shipped."]);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn skip_words_preserves_remaining_formatting() {
        assert_eq!(skip_words("a b c\n\nd", 2), "c\n\nd");
        assert_eq!(skip_words("a b", 5), "");
    }

    #[test]
    fn boundary_overlap_requires_minimum_run() {
        assert_eq!(boundary_overlap("x y the", "the end"), 0);
        assert_eq!(boundary_overlap("p q r s", "q r s t"), 3);
    }

    #[test]
    fn oversized_sentence_is_split_on_words() {
        let long = "word ".repeat(100);
        let pieces = split_oversized(long.trim(), 10);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| estimate_tokens(p) <= 10));
    }

    #[test]
    fn unbroken_word_is_cut_at_char_boundaries() {
        let pieces = split_oversized(&"é".repeat(90), 10);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].chars().count(), 40);
        assert_eq!(pieces[2].chars().count(), 10);
    }
}
