//! Delivery-side chunking of assistant replies.

/// Splits `text` into chunks of at most `limit` characters, preserving
/// order. Prefers breaking at a newline, then a space, and never splits
/// inside a character.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if limit == 0 {
        return chunks;
    }

    let mut rest = text.trim_end();
    while !rest.is_empty() {
        let hard = match rest.char_indices().nth(limit) {
            Some((byte_index, _)) => byte_index,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let slice = &rest[..hard];
        let cut = slice
            .rfind('\n')
            .filter(|&i| i > 0)
            .or_else(|| slice.rfind(' ').filter(|&i| i > 0))
            .unwrap_or(hard);

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }

    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}
