// ==============================================================================
// markup.rs - Annotation Text Cleanup
// ==============================================================================
// Description: Minimal tag stripping and entity decoding for guideline text
// Created: 2025-11-21
// Modified: 2025-11-21
// Version: 1.0.0
// ==============================================================================

/// Remove markup tags and decode character entities.
///
/// A tag is `<` followed by a letter, `/`, `!` or `?`, running to the next
/// `>`. Anything else starting with `<` (e.g. "< 5 mg") is kept as text, as
/// is an unterminated tag.
pub fn strip_markup(input: &str) -> String {
    let mut text = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let candidate = &rest[open..];

        let starts_tag = candidate[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));

        match candidate.find('>') {
            Some(close) if starts_tag => rest = &candidate[close + 1..],
            _ => {
                text.push('<');
                rest = &candidate[1..];
            }
        }
    }
    text.push_str(rest);

    decode_entities(&text)
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let numeric = entity.strip_prefix('#')?;
            let code = match numeric.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp + 1..];

        // Entities are short; a distant ';' belongs to ordinary text
        let decoded = candidate
            .find(';')
            .filter(|&end| end > 0 && end <= 10)
            .and_then(|end| decode_entity(&candidate[..end]).map(|ch| (ch, end)));

        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags() {
        assert_eq!(
            strip_markup("<p>Use <b>alternative</b> therapy.</p>"),
            "Use alternative therapy."
        );
        assert_eq!(strip_markup("<a href=\"x\">link</a><br/>"), "link");
    }

    #[test]
    fn test_keeps_comparisons() {
        assert_eq!(strip_markup("dose < 5 mg"), "dose < 5 mg");
        assert_eq!(strip_markup("a <b"), "a <b");
    }

    #[test]
    fn test_decodes_entities() {
        assert_eq!(strip_markup("A &amp; B &lt;3&gt;"), "A & B <3>");
        assert_eq!(strip_markup("&#8805; 1 &#x3bc;g"), "\u{2265} 1 \u{3bc}g");
        assert_eq!(strip_markup("R&D; fish & chips"), "R&D; fish & chips");
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(strip_markup("No change needed"), "No change needed");
        assert_eq!(strip_markup(""), "");
    }
}
