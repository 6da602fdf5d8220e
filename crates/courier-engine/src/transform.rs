//! Text transform pipeline.
//!
//! Applies the worker's ordered find/replace rules to message text and
//! captions. Rules are compiled once per config reload; the forwarding loop
//! only ever sees an already-valid pipeline because
//! [`RelayConfig::validate`](courier_types::RelayConfig::validate) rejects
//! bad patterns at mutation time.

use regex::{Regex, RegexBuilder};

use courier_types::{RelayError, ReplacementRule};

#[derive(Debug)]
enum CompiledRule {
    /// Case-sensitive literal, applied with plain string replacement.
    Literal { find: String, replace: String },
    /// Everything else: a compiled pattern (escaped for literal rules),
    /// substituted without expansion so `replace` is always taken verbatim.
    Pattern { regex: Regex, replace: String },
}

/// Compiled transform state for one worker.
#[derive(Debug)]
pub struct TransformPipeline {
    rules: Vec<CompiledRule>,
}

impl TransformPipeline {
    pub fn new(rules: &[ReplacementRule]) -> Result<Self, RelayError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.find.is_empty() {
                continue;
            }
            if !rule.is_regex && rule.case_sensitive {
                compiled.push(CompiledRule::Literal {
                    find: rule.find.clone(),
                    replace: rule.replace.clone(),
                });
                continue;
            }

            let pattern = if rule.is_regex {
                rule.find.clone()
            } else {
                regex::escape(&rule.find)
            };
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(!rule.case_sensitive)
                .build()
                .map_err(|e| RelayError::Rule {
                    find: rule.find.clone(),
                    reason: e.to_string(),
                })?;
            compiled.push(CompiledRule::Pattern {
                regex,
                replace: rule.replace.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Apply every rule, in configuration order, to `text`.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            current = match rule {
                CompiledRule::Literal { find, replace } => current.replace(find, replace),
                CompiledRule::Pattern { regex, replace } => regex
                    .replace_all(&current, regex::NoExpand(replace))
                    .into_owned(),
            };
        }
        current
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
