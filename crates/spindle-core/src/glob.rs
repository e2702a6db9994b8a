// Branch/tag glob matching for trigger constraints
//
// Semantics: literal bytes compare exactly, `*` matches any run of non-`/`
// characters, `**` spans `/`, and patterns are anchored at both ends.

use globset::GlobBuilder;

/// Does `pattern` match the whole of `target`?
/// A pattern that fails to compile matches nothing.
pub fn pattern_matches(pattern: &str, target: &str) -> bool {
    let glob = match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob,
        Err(err) => {
            tracing::warn!(pattern, error = %err, "Ignoring malformed glob pattern");
            return false;
        }
    };
    glob.compile_matcher().is_match(target)
}

/// Does any pattern in the list match `target`?
pub fn any_match(patterns: &[String], target: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, target))
}

/// Git ref classified for constraint matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefName<'a> {
    Branch(&'a str),
    Tag(&'a str),
}

/// Split a fully-qualified ref into the name tested against `branch`/`tag`
/// patterns. A bare name is treated as a branch.
pub fn classify_ref(git_ref: &str) -> RefName<'_> {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        RefName::Tag(tag)
    } else if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        RefName::Branch(branch)
    } else {
        RefName::Branch(git_ref)
    }
}
