//! Filename Patterns and Templates
//!
//! A [`Pattern`] is a regular expression with named capture groups that is
//! always matched against the *whole* path. Matching a path yields a
//! [`Binding`] of capture names to the matched text, from which
//! [`Template`]s render companion inputs, extra parameters and outputs.
//!
//! ```
//! use fastflow::pipeline::pattern::{MatchOutcome, Pattern, Template};
//!
//! let pattern = Pattern::new(r"(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz").unwrap();
//! let template = Template::parse("{path}/{sample}_R2.fastq.gz").unwrap();
//!
//! match pattern.match_path("data/s1_R1.fastq.gz") {
//!     MatchOutcome::Matched(binding) => {
//!         assert_eq!(template.render(&binding).unwrap(), "data/s1_R2.fastq.gz");
//!     }
//!     MatchOutcome::NotMatched => unreachable!(),
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::error::ConfigError;

/// Capture values extracted from one matched path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Binding {
    values: BTreeMap<String, String>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

/// Result of applying a pattern to a path.
///
/// A path that does not match is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(Binding),
    NotMatched,
}

impl MatchOutcome {
    pub fn binding(self) -> Option<Binding> {
        match self {
            Self::Matched(binding) => Some(binding),
            Self::NotMatched => None,
        }
    }
}

/// A full-path regular expression with named captures.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    names: Vec<String>,
}

impl Pattern {
    /// Compiles a pattern. The expression is wrapped as `^(?:...)$`, so a
    /// path only matches when the whole of it is consumed.
    pub fn new(source: &str) -> Result<Self, ConfigError> {
        let anchored = format!("^(?:{})$", source);
        let regex = Regex::new(&anchored).map_err(|e| ConfigError::InvalidPattern {
            pattern: source.to_string(),
            source: e,
        })?;

        let names = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();

        Ok(Self {
            source: source.to_string(),
            regex,
            names,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of the capture groups, in declaration order.
    pub fn capture_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_capture(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Matches `path` against the pattern.
    ///
    /// Optional groups that did not participate in the match bind to the
    /// empty string, so every declared name is always present.
    pub fn match_path(&self, path: &str) -> MatchOutcome {
        let Some(caps) = self.regex.captures(path) else {
            return MatchOutcome::NotMatched;
        };

        let mut binding = Binding::new();
        for name in &self.names {
            let value = caps.name(name).map(|m| m.as_str()).unwrap_or_default();
            binding.insert(name.clone(), value);
        }
        MatchOutcome::Matched(binding)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

/// A string with `{name}` placeholders. `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// A template referenced a name the binding does not define.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingBinding {
    pub template: String,
    pub name: String,
}

impl fmt::Display for MissingBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "template '{}' references unbound name '{}'",
            self.template, self.name
        )
    }
}

impl std::error::Error for MissingBinding {}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    let name = name.trim().to_string();
                    if !closed || name.is_empty() {
                        return Err(ConfigError::UnterminatedPlaceholder(source.to_string()));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Capture(name));
                }
                _ => literal.push(ch),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names used by this template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Capture(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_placeholders(&self) -> bool {
        self.placeholders().next().is_some()
    }

    /// Checks every placeholder against the capture names of `pattern`.
    pub fn check_against(&self, pattern: &Pattern) -> Result<(), ConfigError> {
        self.check_names(|name| pattern.has_capture(name))
    }

    /// Checks every placeholder with a caller-supplied predicate.
    pub fn check_names(&self, known: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        match self.placeholders().find(|name| !known(name)) {
            Some(name) => Err(ConfigError::UnknownCapture {
                template: self.source.clone(),
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn render(&self, binding: &Binding) -> Result<String, MissingBinding> {
        self.render_with(|name| binding.get(name).map(str::to_string))
    }

    /// Renders using an arbitrary lookup for placeholder values.
    pub fn render_with(
        &self,
        mut lookup: impl FnMut(&str) -> Option<String>,
    ) -> Result<String, MissingBinding> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Capture(name) => {
                    let value = lookup(name).ok_or_else(|| MissingBinding {
                        template: self.source.clone(),
                        name: name.clone(),
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
