//! Name tokenization shared by indexing and querying.

/// Split `text` into lowercase search tokens.
///
/// Tokens are maximal runs of alphanumeric characters. A switch between CJK
/// and non-CJK characters also ends a run, so `报告2024` yields `报告` and
/// `2024`. Duplicates are dropped, first occurrence wins.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_is_cjk = false;

    for c in text.chars() {
        if !c.is_alphanumeric() {
            push_token(&mut tokens, &mut current);
            continue;
        }
        let cjk = is_cjk(c);
        if !current.is_empty() && cjk != current_is_cjk {
            push_token(&mut tokens, &mut current);
        }
        current_is_cjk = cjk;
        current.extend(c.to_lowercase());
    }
    push_token(&mut tokens, &mut current);

    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    if current.is_empty() {
        return;
    }
    let token = std::mem::take(current);
    if !tokens.contains(&token) {
        tokens.push(token);
    }
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF     // Hiragana, Katakana
            | 0x3400..=0x4DBF   // CJK Extension A
            | 0x4E00..=0x9FFF   // CJK Unified Ideographs
            | 0xAC00..=0xD7AF   // Hangul syllables
            | 0xF900..=0xFAFF   // CJK Compatibility Ideographs
            | 0x20000..=0x2A6DF // CJK Extension B
    )
}
