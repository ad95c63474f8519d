//! JUnit XML summaries.
//!
//! Only the counters on the root `<testsuites>`/`<testsuite>` element are
//! read; test case bodies are left to whoever opens the report.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JunitSummary {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl JunitSummary {
    /// Parse the root counters. An aggregate `<testsuites>` element is used
    /// when it carries counters, otherwise the first `<testsuite>`.
    /// `None` when no suite element exists.
    pub fn parse(xml: &str) -> Option<Self> {
        let tag = element_tag(xml, "<testsuites")
            .filter(|tag| attribute(tag, "tests").is_some())
            .or_else(|| element_tag(xml, "<testsuite"))?;
        Some(Self {
            tests: attribute(tag, "tests").unwrap_or(0),
            failures: attribute(tag, "failures").unwrap_or(0),
            errors: attribute(tag, "errors").unwrap_or(0),
            skipped: attribute(tag, "skipped")
                .or_else(|| attribute(tag, "skips"))
                .unwrap_or(0),
        })
    }

    pub fn read(path: &Path) -> Option<Self> {
        std::fs::read_to_string(path).ok().and_then(|xml| Self::parse(&xml))
    }

    /// Errors were reported and nothing failed outright.
    pub fn only_errors(&self) -> bool {
        self.errors > 0 && self.failures == 0
    }
}

fn element_tag<'a>(xml: &'a str, open: &str) -> Option<&'a str> {
    let (start, _) = xml.match_indices(open).find(|(idx, _)| {
        let next = xml[idx + open.len()..].chars().next();
        matches!(next, Some(c) if c.is_whitespace() || c == '>' || c == '/')
    })?;
    let end = xml[start..].find('>')? + start;
    Some(&xml[start..end])
}

fn attribute(tag: &str, name: &str) -> Option<u64> {
    let mut rest = tag;
    while let Some(idx) = rest.find(name) {
        let before = rest[..idx].chars().last();
        let after = &rest[idx + name.len()..];
        if matches!(before, Some(c) if c.is_whitespace()) {
            if let Some(value) = after.trim_start().strip_prefix('=') {
                let value = value.trim_start();
                let quote = value.chars().next()?;
                if quote == '"' || quote == '\'' {
                    let body = &value[1..];
                    let close = body.find(quote)?;
                    return body[..close].trim().parse().ok();
                }
            }
        }
        rest = after;
    }
    None
}
