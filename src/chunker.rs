//! Outbound text chunking.
//!
//! Splits long payloads into ordered chunks under the channel's length
//! limit. Plain mode is lossless: concatenating the chunks reproduces the
//! input byte for byte. Markdown mode additionally refuses to cut through a
//! code fence, closing and reopening it across the split instead.

use crate::config::ChunkMode;
use crate::util::floor_utf8_char_boundary;

/// Split `text` into chunks of at most `limit` characters-worth of bytes.
pub fn chunk_text(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    if limit == 0 || text.len() <= limit {
        return vec![text.to_string()];
    }
    match mode {
        ChunkMode::Plain => chunk_plain(text, limit),
        ChunkMode::Markdown => chunk_markdown(text, limit),
    }
}

/// Lossless split: prefers a newline in the back half of the window, then a
/// space, then a hard cut at the nearest UTF-8 boundary.
fn chunk_plain(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let chunk_end = if remaining.len() <= limit {
            remaining.len()
        } else {
            let window_end = floor_utf8_char_boundary(remaining, limit);
            if window_end == 0 {
                // Limit is narrower than the first character: take the whole
                // character anyway so the loop always advances.
                remaining.chars().next().map_or(remaining.len(), char::len_utf8)
            } else {
                let search_area = &remaining[..window_end];

                if let Some(pos) = search_area.rfind('\n') {
                    if pos >= limit / 2 {
                        pos + 1
                    } else {
                        search_area.rfind(' ').map_or(window_end, |p| p + 1)
                    }
                } else if let Some(pos) = search_area.rfind(' ') {
                    pos + 1
                } else {
                    window_end
                }
            }
        };

        chunks.push(remaining[..chunk_end].to_string());
        remaining = &remaining[chunk_end..];
    }

    chunks
}

/// Line-oriented split that never leaves a ``` fence dangling. A fence open
/// at a split point is closed at the end of the chunk and reopened at the
/// start of the next one.
fn chunk_markdown(text: &str, limit: usize) -> Vec<String> {
    const FENCE: &str = "```";

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;
    let mut fence_header = String::new();

    let flush = |chunks: &mut Vec<String>, current: &mut String, in_fence: bool| {
        if in_fence {
            if !current.ends_with('\n') {
                current.push('\n');
            }
            current.push_str(FENCE);
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
    };

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let is_fence_line = trimmed.starts_with(FENCE);

        // A single line longer than the limit falls back to a hard split.
        if line.len() > limit {
            flush(&mut chunks, &mut current, in_fence);
            if in_fence {
                current.push_str(&fence_header);
                current.push('\n');
            }
            for piece in chunk_plain(line, limit.saturating_sub(FENCE.len() + 1)) {
                if current.len() + piece.len() > limit {
                    flush(&mut chunks, &mut current, in_fence);
                    if in_fence {
                        current.push_str(&fence_header);
                        current.push('\n');
                    }
                }
                current.push_str(&piece);
            }
            if is_fence_line {
                in_fence = !in_fence;
                fence_header = if in_fence { trimmed.to_string() } else { String::new() };
            }
            continue;
        }

        let reopen_cost = if in_fence { fence_header.len() + 1 } else { 0 };
        let close_cost = if in_fence { FENCE.len() + 1 } else { 0 };
        if current.len() + line.len() + close_cost > limit && !current.is_empty() {
            flush(&mut chunks, &mut current, in_fence);
            if in_fence && reopen_cost + line.len() <= limit {
                current.push_str(&fence_header);
                current.push('\n');
            }
        }

        current.push_str(line);
        if is_fence_line {
            in_fence = !in_fence;
            fence_header = if in_fence { trimmed.to_string() } else { String::new() };
        }
    }

    flush(&mut chunks, &mut current, in_fence);

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
