//! Paragraph-boundary text chunker.
//!
//! Splits document body text into content pieces that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph
//! boundaries (`\n\n`) to preserve semantic coherence within each chunk.
//! The returned order is the chunk-index order: piece *i* becomes the
//! chunk with index *i*.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunk contents on paragraph boundaries, respecting
/// max_tokens. Always returns at least one piece.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    if text.is_empty() {
        return vec![String::new()];
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        // If a single paragraph exceeds max, hard-split it
        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                pieces.push(std::mem::take(&mut current_buf));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = remaining.len().min(max_chars);
                // Prefer a newline or space boundary
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                pieces.push(remaining[..actual_split].trim().to_string());
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    // Flush remaining
    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    // Guarantee at least one chunk
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
}
