use tether_types::ToolUse;

/// Flags a model that keeps issuing the same invocation. A limit of zero
/// disables the check.
#[derive(Debug, Default)]
pub struct RepetitionDetector {
    limit: u32,
    previous: Option<String>,
    repeats: u32,
}

impl RepetitionDetector {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            previous: None,
            repeats: 0,
        }
    }

    /// Returns `false` once more than `limit` identical invocations arrive in
    /// a row. The streak starts over after it is reported.
    pub fn check(&mut self, tool: &ToolUse) -> bool {
        let key = tool.to_tag_text();
        if self.previous.as_deref() == Some(key.as_str()) {
            self.repeats += 1;
        } else {
            self.previous = Some(key);
            self.repeats = 1;
        }
        if self.limit > 0 && self.repeats > self.limit {
            self.previous = None;
            self.repeats = 0;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{ToolId, ToolParam};

    fn read(path: &str) -> ToolUse {
        let mut tool = ToolUse::new(ToolId::ReadFile);
        tool.params.insert(ToolParam::Path, path.to_string());
        tool.partial = false;
        tool
    }

    #[test]
    fn fourth_identical_call_is_flagged() {
        let mut detector = RepetitionDetector::new(3);
        assert!(detector.check(&read("a")));
        assert!(detector.check(&read("a")));
        assert!(detector.check(&read("a")));
        assert!(!detector.check(&read("a")));
        assert!(detector.check(&read("a")));
    }

    #[test]
    fn different_params_reset_the_streak() {
        let mut detector = RepetitionDetector::new(2);
        assert!(detector.check(&read("a")));
        assert!(detector.check(&read("a")));
        assert!(detector.check(&read("b")));
        assert!(detector.check(&read("a")));
        assert!(detector.check(&read("a")));
        assert!(!detector.check(&read("a")));
    }

    #[test]
    fn zero_limit_disables() {
        let mut detector = RepetitionDetector::new(0);
        assert!((0..10).all(|_| detector.check(&read("a"))));
    }
}
