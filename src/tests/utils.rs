/// Split a string into chunks of `chunk_size` characters
pub fn chunk_str(s: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut chunks = Vec::new();

    for chunk in chars.chunks(chunk_size) {
        chunks.push(chunk.iter().collect::<String>());
    }

    chunks
}

/// Every way to split `s` into two non-empty pieces at a character boundary
pub fn two_way_splits(s: &str) -> Vec<Vec<String>> {
    s.char_indices()
        .skip(1)
        .map(|(at, _)| vec![s[..at].to_string(), s[at..].to_string()])
        .collect()
}
