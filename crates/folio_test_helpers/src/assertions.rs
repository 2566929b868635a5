//! Output predicates for Folio tests

use predicates::prelude::*;
use predicates::str::contains;

/// stderr contains none of `values`
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned: Vec<String> = values.iter().map(|s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned.iter().any(|v| s.contains(v.as_str())))
}

/// Output looks like a pretty-printed JSON object
pub fn json_object() -> impl Predicate<str> {
    predicate::function(|s: &str| {
        let trimmed = s.trim();
        trimmed.starts_with('{') && trimmed.ends_with('}')
    })
}

/// Output mentions filter `id` the way the CLI prints it
pub fn lists_filter(id: i32) -> impl Predicate<str> {
    contains(format!("[{}]", id))
}
