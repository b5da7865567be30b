use crate::script::{EditScript, SectionStage};
use crate::PatchError;

/// Applies the sections located so far to `original`.
///
/// Sections still collecting their search text contribute nothing. The
/// untouched remainder of the original is appended only for a final script.
pub fn apply_edit_script(script: &EditScript, original: &str) -> Result<String, PatchError> {
    let mut out = String::with_capacity(original.len());
    let mut last_processed = 0usize;

    for section in &script.sections {
        if section.stage == SectionStage::Searching {
            break;
        }
        let (start, end) = locate(original, &section.search, last_processed)?;
        out.push_str(&original[last_processed..start]);
        out.push_str(&section.replace);
        last_processed = end;
    }

    if script.is_final && last_processed < original.len() {
        out.push_str(&original[last_processed..]);
    }
    Ok(out)
}

fn locate(original: &str, search: &str, from: usize) -> Result<(usize, usize), PatchError> {
    if search.is_empty() {
        if original.is_empty() {
            return Ok((0, 0));
        }
        return Ok((from, original.len()));
    }
    if let Some(offset) = original[from..].find(search) {
        let start = from + offset;
        return Ok((start, start + search.len()));
    }
    line_trimmed_match(original, search, from).ok_or_else(|| PatchError::SearchNotFound {
        search: search.trim_end().to_string(),
    })
}

/// Finds a run of original lines whose trimmed contents equal the search
/// lines, starting at the first line that begins at or after `from`. The span
/// covers the original lines in full, indentation and newline included.
fn line_trimmed_match(original: &str, search: &str, from: usize) -> Option<(usize, usize)> {
    let original_lines: Vec<&str> = original.split('\n').collect();
    let mut search_lines: Vec<&str> = search.split('\n').collect();
    if search_lines.last() == Some(&"") {
        search_lines.pop();
    }
    if search_lines.is_empty() || search_lines.len() > original_lines.len() {
        return None;
    }

    let mut line_starts = Vec::with_capacity(original_lines.len());
    let mut offset = 0usize;
    for line in &original_lines {
        line_starts.push(offset);
        offset += line.len() + 1;
    }

    let first_line = line_starts
        .iter()
        .position(|start| *start >= from)
        .unwrap_or(original_lines.len());

    for i in first_line..=(original_lines.len() - search_lines.len()) {
        let matches = search_lines
            .iter()
            .enumerate()
            .all(|(j, s)| original_lines[i + j].trim() == s.trim());
        if !matches {
            continue;
        }
        let start = line_starts[i];
        let end: usize = start
            + original_lines[i..i + search_lines.len()]
                .iter()
                .map(|l| l.len() + 1)
                .sum::<usize>();
        return Some((start, end.min(original.len())));
    }
    None
}
