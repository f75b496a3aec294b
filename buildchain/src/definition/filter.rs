//! Branch filters compiled from `+:pattern` / `-:pattern` rules.

use crate::core::{full_branch_ref, short_branch_name};
use crate::errors::InvalidFilterError;
use regex::Regex;

/// Placeholder for the VCS root's default branch.
pub const DEFAULT_BRANCH_PLACEHOLDER: &str = "<default>";

#[derive(Debug, Clone)]
struct FilterRule {
    include: bool,
    source: String,
    regex: Regex,
}

/// A branch filter compiled once at load time.
///
/// A branch matches when it matches some include rule (or the filter has
/// no include rules) and no exclude rule. Rules are tried against both the
/// full ref and the short branch name.
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    rules: Vec<FilterRule>,
}

impl BranchFilter {
    /// A filter that accepts every branch.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Compiles filter rules.
    ///
    /// `default_branch` resolves the `<default>` placeholder; a filter using
    /// the placeholder without a default branch is rejected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilterError` for empty patterns, unknown rule
    /// prefixes, whitespace or control characters, or an unresolvable
    /// `<default>`.
    pub fn compile(
        stage: &str,
        rules: &[String],
        default_branch: Option<&str>,
    ) -> Result<Self, InvalidFilterError> {
        let rules = rules
            .iter()
            .map(|rule| compile_rule(stage, rule, default_branch))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Returns true if the branch passes the filter.
    #[must_use]
    pub fn matches(&self, branch: &str) -> bool {
        let full = full_branch_ref(branch);
        let short = short_branch_name(branch);
        let hit = |rule: &FilterRule| rule.regex.is_match(&full) || rule.regex.is_match(short);

        let mut includes = self.rules.iter().filter(|r| r.include).peekable();
        let included = includes.peek().is_none() || includes.any(hit);
        included && !self.rules.iter().filter(|r| !r.include).any(hit)
    }

    /// The rule sources, as written in the configuration.
    #[must_use]
    pub fn rules(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.source.as_str()).collect()
    }

    /// Returns true if the filter has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(
    stage: &str,
    rule: &str,
    default_branch: Option<&str>,
) -> Result<FilterRule, InvalidFilterError> {
    let invalid = |reason: &str| InvalidFilterError::new(stage, rule, reason);

    let (include, pattern) = if let Some(rest) = rule.strip_prefix("+:") {
        (true, rest)
    } else if let Some(rest) = rule.strip_prefix("-:") {
        (false, rest)
    } else if rule.contains(':') {
        return Err(invalid("unknown rule prefix, expected '+:' or '-:'"));
    } else {
        (true, rule)
    };

    if pattern.is_empty() {
        return Err(invalid("empty pattern"));
    }
    if pattern.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("pattern contains whitespace or control characters"));
    }

    let pattern = if pattern == DEFAULT_BRANCH_PLACEHOLDER {
        default_branch.ok_or_else(|| invalid("'<default>' used without a VCS root"))?
    } else {
        pattern
    };

    let regex = wildcard_regex(pattern).map_err(|e| invalid(&e.to_string()))?;
    Ok(FilterRule {
        include,
        source: rule.to_string(),
        regex,
    })
}

/// Compiles a `*`/`?` wildcard pattern into an anchored regex.
pub(crate) fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rules: &[&str]) -> BranchFilter {
        let rules: Vec<String> = rules.iter().map(|s| (*s).to_string()).collect();
        BranchFilter::compile("Build", &rules, Some("refs/heads/main")).unwrap()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = BranchFilter::any();
        assert!(f.matches("main"));
        assert!(f.matches("refs/heads/feature/x"));
        assert!(f.is_empty());
    }

    #[test]
    fn test_include_rules() {
        let f = filter(&["+:main", "+:release/*"]);
        assert!(f.matches("main"));
        assert!(f.matches("refs/heads/main"));
        assert!(f.matches("release/1.2"));
        assert!(!f.matches("feature/login"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = filter(&["+:*", "-:wip/*"]);
        assert!(f.matches("feature/a"));
        assert!(!f.matches("wip/experiment"));
        assert!(!f.matches("refs/heads/wip/experiment"));
    }

    #[test]
    fn test_exclude_only_filter() {
        let f = filter(&["-:dependabot/*"]);
        assert!(f.matches("main"));
        assert!(!f.matches("dependabot/npm"));
    }

    #[test]
    fn test_default_placeholder() {
        let f = filter(&["+:<default>"]);
        assert!(f.matches("main"));
        assert!(f.matches("refs/heads/main"));
        assert!(!f.matches("develop"));
    }

    #[test]
    fn test_question_mark_and_escaping() {
        let f = filter(&["v?.x"]);
        assert!(f.matches("v1.x"));
        assert!(!f.matches("v1ax"));
        assert!(!f.matches("v10.x"));
    }

    #[test]
    fn test_invalid_rules() {
        let compile = |rule: &str, default: Option<&str>| {
            BranchFilter::compile("Build", &[rule.to_string()], default)
        };

        assert!(compile("+:", None).is_err());
        assert!(compile("x:main", None).is_err());
        assert!(compile("+:main branch", None).is_err());
        let err = compile("<default>", None).unwrap_err();
        assert_eq!(err.stage, "Build");
        assert!(err.reason.contains("VCS root"));
    }

    #[test]
    fn test_rules_are_kept() {
        let f = filter(&["+:main", "-:wip/*"]);
        assert_eq!(f.rules(), vec!["+:main", "-:wip/*"]);
    }
}
