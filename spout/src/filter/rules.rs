// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./rules_test.rs"]
mod rules_test;

use crate::config::RawRule;
use crate::protos::influx::{escape_measurement, measurement_name};
use anyhow::{Context, bail};
use regex::bytes::Regex;

//
// RuleKind
//

// A closed set of match strategies. Dispatch happens per line on the hot
// path, so this is an enum rather than a trait object.
#[derive(Debug)]
enum RuleKind {
  // Byte-for-byte equality against the (escaped) measurement name.
  Basic(Vec<u8>),
  // Any match of the pattern anywhere in the raw line bytes.
  Regex(Regex),
  // The inverse: lines the pattern does NOT match. Such a rule matches many
  // lines; order it accordingly.
  NegativeRegex(Regex),
}

//
// Rule
//

/// A single filter rule: a predicate over a line plus the bus subject that
/// receives lines it matches. Immutable once built.
#[derive(Debug)]
pub struct Rule {
  kind: RuleKind,
  subject: String,
}

impl Rule {
  /// A rule matching lines whose measurement name equals `measurement`
  /// exactly. The operand is stored escaped so comparison runs against the
  /// wire form of the line without unescaping.
  #[must_use]
  pub fn basic(measurement: &str, subject: &str) -> Self {
    Self {
      kind: RuleKind::Basic(escape_measurement(measurement)),
      subject: subject.to_string(),
    }
  }

  /// A rule matching lines the compiled pattern matches anywhere.
  pub fn regex(pattern: &str, subject: &str) -> anyhow::Result<Self> {
    Ok(Self {
      kind: RuleKind::Regex(
        Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?,
      ),
      subject: subject.to_string(),
    })
  }

  /// A rule matching lines the compiled pattern does not match.
  pub fn negative_regex(pattern: &str, subject: &str) -> anyhow::Result<Self> {
    Ok(Self {
      kind: RuleKind::NegativeRegex(
        Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?,
      ),
      subject: subject.to_string(),
    })
  }

  #[must_use]
  pub fn subject(&self) -> &str {
    &self.subject
  }

  fn matches(&self, line: &[u8]) -> bool {
    match &self.kind {
      RuleKind::Basic(measurement) => measurement_name(line) == measurement.as_slice(),
      RuleKind::Regex(re) => re.is_match(line),
      RuleKind::NegativeRegex(re) => !re.is_match(line),
    }
  }
}

//
// RuleSet
//

/// An ordered rule collection. Built once at startup and shared read-only by
/// every filter worker; order is significant since `lookup` returns the
/// first match.
#[derive(Default, Debug)]
pub struct RuleSet {
  rules: Vec<Rule>,
}

impl RuleSet {
  /// Compile the ordered rule list from configuration. Fails on an unknown
  /// rule type or an uncompilable pattern.
  pub fn from_config(raw_rules: &[RawRule]) -> anyhow::Result<Self> {
    let mut rules = Self::default();
    for raw in raw_rules {
      match raw.rule_type.as_str() {
        "basic" => rules.append(Rule::basic(&raw.pattern, &raw.subject)),
        "regex" => rules.append(Rule::regex(&raw.pattern, &raw.subject)?),
        "negative_regex" => rules.append(Rule::negative_regex(&raw.pattern, &raw.subject)?),
        unknown => bail!("unknown rule type {unknown:?}"),
      }
    }
    Ok(rules)
  }

  pub fn append(&mut self, rule: Rule) {
    self.rules.push(rule);
  }

  #[must_use]
  pub fn count(&self) -> usize {
    self.rules.len()
  }

  /// The destination subjects in rule order.
  #[must_use]
  pub fn subjects(&self) -> Vec<String> {
    self.rules.iter().map(|r| r.subject.clone()).collect()
  }

  /// The destination subject of rule `index`.
  #[must_use]
  pub fn subject(&self, index: usize) -> &str {
    &self.rules[index].subject
  }

  /// Return the index of the first rule matching `line`, scanning in
  /// insertion order.
  #[must_use]
  pub fn lookup(&self, line: &[u8]) -> Option<usize> {
    self.rules.iter().position(|rule| rule.matches(line))
  }
}
