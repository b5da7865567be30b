/// How far a section has streamed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionStage {
    /// Search text still arriving; the section cannot be located yet.
    Searching,
    /// Divider seen; replacement lines stream straight into the output.
    Replacing,
    /// Replace-end marker seen.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSection {
    pub search: String,
    pub replace: String,
    pub stage: SectionStage,
}

/// An ordered list of find/replace sections, applied left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    pub sections: Vec<EditSection>,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    SearchStart,
    Divider,
    ReplaceEnd,
}

fn run_then_suffix(line: &str, ch: char, suffix: &str) -> bool {
    let run = line.chars().take_while(|c| *c == ch).count();
    if run < 3 {
        return false;
    }
    let rest = &line[run * ch.len_utf8()..];
    rest == suffix || rest.strip_suffix('>') == Some(suffix)
}

fn classify(line: &str) -> Option<Marker> {
    if run_then_suffix(line, '-', " SEARCH") || run_then_suffix(line, '<', " SEARCH") {
        return Some(Marker::SearchStart);
    }
    if line.len() >= 3 && line.chars().all(|c| c == '=') {
        return Some(Marker::Divider);
    }
    if run_then_suffix(line, '+', " REPLACE") || run_then_suffix(line, '>', " REPLACE") {
        return Some(Marker::ReplaceEnd);
    }
    None
}

fn looks_like_marker_prefix(line: &str) -> bool {
    matches!(line.chars().next(), Some('-' | '<' | '=' | '+' | '>'))
}

impl EditScript {
    /// Parses the script text received so far.
    ///
    /// While streaming, a trailing line that could still grow into a marker is
    /// held back until it is complete. Lines outside any section are ignored.
    pub fn parse(text: &str, is_final: bool) -> Self {
        let mut lines: Vec<&str> = text.split('\n').collect();
        if text.ends_with('\n') {
            lines.pop();
        } else if let Some(last) = lines.last() {
            if !is_final && looks_like_marker_prefix(last) && classify(last).is_none() {
                lines.pop();
            }
        }

        let mut sections: Vec<EditSection> = Vec::new();
        for raw in lines {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            match classify(line) {
                Some(Marker::SearchStart) => sections.push(EditSection {
                    search: String::new(),
                    replace: String::new(),
                    stage: SectionStage::Searching,
                }),
                Some(Marker::Divider) => {
                    if let Some(section) = sections.last_mut() {
                        if section.stage == SectionStage::Searching {
                            section.stage = SectionStage::Replacing;
                        }
                    }
                }
                Some(Marker::ReplaceEnd) => {
                    if let Some(section) = sections.last_mut() {
                        if section.stage == SectionStage::Replacing {
                            section.stage = SectionStage::Closed;
                        }
                    }
                }
                None => {
                    let Some(section) = sections.last_mut() else {
                        continue;
                    };
                    match section.stage {
                        SectionStage::Searching => {
                            section.search.push_str(raw);
                            section.search.push('\n');
                        }
                        SectionStage::Replacing => {
                            section.replace.push_str(raw);
                            section.replace.push('\n');
                        }
                        SectionStage::Closed => {}
                    }
                }
            }
        }

        Self { sections, is_final }
    }
}
