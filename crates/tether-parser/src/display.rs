/// Prepares a text block for display: drops reasoning markup and, while the
/// block is still streaming, an unterminated tag fragment at the end.
pub fn clean_text_for_display(text: &str, partial: bool) -> String {
    let mut content = text.replace("<thinking>\n", "").replace("<thinking>", "");
    content = content.replace("\n</thinking>", "").replace("</thinking>", "");

    if partial {
        if let Some(idx) = content.rfind('<') {
            let fragment = &content[idx..];
            if !fragment.contains('>') {
                let name = fragment
                    .strip_prefix("</")
                    .or_else(|| fragment.strip_prefix('<'))
                    .unwrap_or(fragment)
                    .trim();
                let looks_like_tag =
                    name.is_empty() || name.chars().all(|c| c.is_ascii_alphabetic() || c == '_');
                if looks_like_tag {
                    content.truncate(idx);
                }
            }
        }
    }

    content.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_reasoning_tags() {
        let out = clean_text_for_display("<thinking>\nplan it\n</thinking>\nDone.", false);
        assert_eq!(out, "plan it\nDone.");
    }

    #[test]
    fn drops_trailing_tag_fragment_only_while_partial() {
        assert_eq!(clean_text_for_display("Reading now <read_fi", true), "Reading now");
        assert_eq!(clean_text_for_display("Reading now </", true), "Reading now");
        assert_eq!(clean_text_for_display("if a < b + c", true), "if a < b + c");
        assert_eq!(
            clean_text_for_display("Reading now <read_fi", false),
            "Reading now <read_fi"
        );
    }
}
