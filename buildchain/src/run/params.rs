//! `%name%` parameter references in step commands and working directories.
//!
//! `%%` is a literal `%`. Names may contain letters, digits, `.`, `_` and `-`.

use crate::definition::StepSpec;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PARAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%([A-Za-z0-9_.\-]*)%").expect("Invalid parameter pattern")
});

/// Replaces every `%name%` reference in `input`.
///
/// # Errors
///
/// Returns the names of all references with no value, in order of
/// appearance.
pub fn expand(input: &str, params: &BTreeMap<String, String>) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let text = PARAM_PATTERN.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).map_or("", |m| m.as_str());
        if name.is_empty() {
            return "%".to_string();
        }
        params.get(name).cloned().unwrap_or_else(|| {
            missing.push(name.to_string());
            String::new()
        })
    });

    if missing.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(missing)
    }
}

/// Expands the command and working directory of every step.
///
/// # Errors
///
/// Returns a message naming the unresolved parameters.
pub fn expand_steps(
    steps: &[StepSpec],
    params: &BTreeMap<String, String>,
) -> Result<Vec<StepSpec>, String> {
    let mut missing = Vec::new();
    let mut expanded = Vec::with_capacity(steps.len());
    for step in steps {
        let mut step = step.clone();
        match expand(&step.command, params) {
            Ok(command) => step.command = command,
            Err(names) => missing.extend(names),
        }
        if let Some(dir) = &step.working_dir {
            match expand(dir, params) {
                Ok(dir) => step.working_dir = Some(dir),
                Err(names) => missing.extend(names),
            }
        }
        expanded.push(step);
    }

    if missing.is_empty() {
        return Ok(expanded);
    }
    missing.dedup();
    Err(format!("unresolved parameters: {}", missing.join(", ")))
}
