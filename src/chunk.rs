//! Text chunking for embedding.
//!
//! Packs extracted document text into pieces of at most `max_chars`,
//! preferring paragraph boundaries (`\n\n`) and falling back to sentence
//! boundaries for oversized paragraphs. Chunk content, not layout, is
//! what embeds, so pieces are joined with single spaces.

use sha2::{Digest, Sha256};

/// Split text into chunks no larger than `max_chars`.
///
/// Returns chunk contents in document order; empty input produces no
/// chunks. Whitespace-only paragraphs are skipped.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if paragraph.len() > max_chars {
            // Oversized paragraph: pack sentence by sentence.
            for sentence in split_sentences(paragraph) {
                if current_len + joined_len(&current, sentence) > max_chars {
                    flush(&mut current, &mut current_len, &mut chunks);
                }
                push_piece(&mut current, &mut current_len, sentence, max_chars, &mut chunks);
            }
        } else {
            if current_len + joined_len(&current, paragraph) > max_chars {
                flush(&mut current, &mut current_len, &mut chunks);
            }
            current_len += joined_len(&current, paragraph);
            current.push(paragraph);
        }
    }

    flush(&mut current, &mut current_len, &mut chunks);
    chunks
}

/// SHA-256 of chunk content, hex-encoded. Used as a staleness marker in
/// chunk metadata.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn flush(current: &mut Vec<&str>, current_len: &mut usize, chunks: &mut Vec<String>) {
    if !current.is_empty() {
        chunks.push(current.join(" "));
        current.clear();
        *current_len = 0;
    }
}

/// Cost of appending `piece` to the current buffer, including the join
/// space when the buffer is non-empty.
fn joined_len(current: &[&str], piece: &str) -> usize {
    if current.is_empty() {
        piece.len()
    } else {
        piece.len() + 1
    }
}

fn split_sentences(paragraph: &str) -> impl Iterator<Item = &str> {
    paragraph
        .split(". ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Append one sentence, hard-splitting at character boundaries when a
/// single sentence alone exceeds the limit.
fn push_piece<'a>(
    current: &mut Vec<&'a str>,
    current_len: &mut usize,
    sentence: &'a str,
    max_chars: usize,
    chunks: &mut Vec<String>,
) {
    if sentence.len() <= max_chars {
        *current_len += joined_len(current, sentence);
        current.push(sentence);
        return;
    }

    // Degenerate case: a single unbroken run longer than the limit.
    if !current.is_empty() {
        chunks.push(current.join(" "));
        current.clear();
        *current_len = 0;
    }
    let mut rest = sentence;
    while !rest.is_empty() {
        let mut split_at = rest.len().min(max_chars);
        while !rest.is_char_boundary(split_at) {
            split_at -= 1;
        }
        chunks.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
}
