/// Punctuation stripped during normalization, covering both the CJK title
/// quotes upstream titles carry and common ASCII separators.
const STRIP_CHARS: &str = "《》“”‘’\"'`~!@#$%^&*()[]{}:;?,./\\|_-";

/// Case-, width- and punctuation-folded form used for all alias and work-name
/// lookups. The same input always folds to the same key.
pub fn normalize_text(value: &str) -> String {
    let mut folded = String::with_capacity(value.len());
    for ch in value.chars() {
        let ch = fold_width(ch);
        if STRIP_CHARS.contains(ch) {
            folded.push(' ');
        } else {
            for lower in ch.to_lowercase() {
                folded.push(lower);
            }
        }
    }

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// City names share the text normalization rules.
pub fn normalize_city(value: &str) -> String {
    normalize_text(value)
}

/// Show titles arrive from the source wrapped in CJK title quotes and
/// surrounded by pricing noise; pull out the bracketed part when present.
pub fn bracketed_title(value: &str) -> &str {
    if let Some(start) = value.find('《')
        && let Some(length) = value[start..].find('》')
    {
        let inner = &value[start + '《'.len_utf8()..start + length];
        if !inner.is_empty() {
            return inner;
        }
    }
    value.trim()
}

fn fold_width(ch: char) -> char {
    match ch {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => {
            char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch)
        }
        _ => ch,
    }
}
