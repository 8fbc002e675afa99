//! Class eligibility rules
//!
//! Decides which loaded classes get instrumented. Supports:
//! - Include prefixes: `com/acme/` (dotted `com.acme.` is accepted too)
//! - Include pattern: regex matched against the whole internal name
//! - Exclude prefixes and an exclude pattern, checked after the includes
//!
//! The instrumentation's own namespace and generated classes (`$$` in the
//! name) are never eligible.

use anyhow::{Context, Result};
use regex::Regex;

/// Internal-name prefix of this crate's own classes
pub const OWN_NAMESPACE: &str = "linescope/";

/// Include/exclude rules for internal class names
#[derive(Debug, Clone, Default)]
pub struct ClassFilter {
    include_prefixes: Vec<String>,
    include_pattern: Option<Regex>,
    exclude_prefixes: Vec<String>,
    exclude_pattern: Option<Regex>,
}

impl ClassFilter {
    /// Filter with no include rule; matches nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Build a filter from configured rules
    pub fn from_rules(
        include: &[String],
        class_regex: Option<&str>,
        exclude: &[String],
        exclude_regex: Option<&str>,
    ) -> Result<Self> {
        let mut filter = Self::none();
        for prefix in include {
            filter = filter.include_prefix(prefix);
        }
        if let Some(pattern) = class_regex {
            filter = filter.include_pattern(pattern)?;
        }
        for prefix in exclude {
            filter = filter.exclude_prefix(prefix);
        }
        if let Some(pattern) = exclude_regex {
            filter = filter.exclude_pattern(pattern)?;
        }
        Ok(filter)
    }

    pub fn include_prefix(mut self, prefix: &str) -> Self {
        let prefix = normalize(prefix);
        if !prefix.is_empty() {
            self.include_prefixes.push(prefix);
        }
        self
    }

    /// Include classes whose entire internal name matches `pattern`
    pub fn include_pattern(mut self, pattern: &str) -> Result<Self> {
        self.include_pattern = Some(full_match(pattern)?);
        Ok(self)
    }

    pub fn exclude_prefix(mut self, prefix: &str) -> Self {
        let prefix = normalize(prefix);
        if !prefix.is_empty() {
            self.exclude_prefixes.push(prefix);
        }
        self
    }

    pub fn exclude_pattern(mut self, pattern: &str) -> Result<Self> {
        self.exclude_pattern = Some(full_match(pattern)?);
        Ok(self)
    }

    /// Whether any include rule is configured
    pub fn has_include_rule(&self) -> bool {
        !self.include_prefixes.is_empty() || self.include_pattern.is_some()
    }

    /// Check if a class should be instrumented
    pub fn should_instrument(&self, class_name: &str) -> bool {
        if class_name.starts_with(OWN_NAMESPACE) || class_name.contains("$$") {
            return false;
        }

        let included = self
            .include_prefixes
            .iter()
            .any(|p| class_name.starts_with(p.as_str()))
            || self
                .include_pattern
                .as_ref()
                .is_some_and(|re| re.is_match(class_name));
        if !included {
            return false;
        }

        let excluded = self
            .exclude_prefixes
            .iter()
            .any(|p| class_name.starts_with(p.as_str()))
            || self
                .exclude_pattern
                .as_ref()
                .is_some_and(|re| re.is_match(class_name));
        !excluded
    }
}

fn normalize(prefix: &str) -> String {
    prefix.trim().replace('.', "/")
}

fn full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .with_context(|| format!("Invalid class name pattern: {pattern}"))
}
