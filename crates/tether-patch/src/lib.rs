//! Streaming SEARCH/REPLACE edit scripts.
//!
//! A script is a sequence of sections:
//!
//! ```text
//! ------- SEARCH
//! exact lines from the file
//! =======
//! replacement lines
//! +++++++ REPLACE
//! ```
//!
//! The legacy `<<<<<<< SEARCH` / `>>>>>>> REPLACE` markers are accepted too.
//! Scripts can be applied to growing prefixes while they stream in; only the
//! final application appends the rest of the original file.

mod apply;
mod script;

use thiserror::Error;

pub use apply::apply_edit_script;
pub use script::{EditScript, EditSection, SectionStage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("The SEARCH block:\n{search}\n...does not match anything in the file.")]
    SearchNotFound { search: String },
}

/// Parses `diff` and applies it to `original` in one step.
pub fn construct_new_file_content(
    diff: &str,
    original: &str,
    is_final: bool,
) -> Result<String, PatchError> {
    apply_edit_script(&EditScript::parse(diff, is_final), original)
}
