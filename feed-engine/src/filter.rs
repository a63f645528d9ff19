use crate::path;
use crate::types::{Condition, FilterSpec, Item, Logic, Operator};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::warn;

/// A filter spec with its regular expressions compiled once per pass.
#[derive(Debug)]
pub struct CompiledFilter {
    logic: Logic,
    conditions: Vec<CompiledCondition>,
}

#[derive(Debug)]
struct CompiledCondition {
    field: String,
    test: Test,
}

#[derive(Debug)]
enum Test {
    Equals(String),
    NotEquals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Matches(Regex),
    NotMatches(Regex),
    Contains(String),
    NotContains(String),
    /// Bad regex or missing operand: never matches.
    Broken,
}

fn operand_text(value: &Value) -> String {
    path::value_text(value).to_lowercase()
}

fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> Self {
        let scalar = || {
            condition
                .value
                .as_ref()
                .or_else(|| condition.values.first())
                .map(operand_text)
        };
        let list = || -> Vec<String> {
            if condition.values.is_empty() {
                match &condition.value {
                    Some(Value::Array(items)) => items.iter().map(operand_text).collect(),
                    Some(other) => vec![operand_text(other)],
                    None => Vec::new(),
                }
            } else {
                condition.values.iter().map(operand_text).collect()
            }
        };
        let compiled_pattern = || {
            let pattern = condition
                .pattern
                .clone()
                .or_else(|| condition.value.as_ref().map(path::value_text));
            match pattern.as_deref().map(build_regex) {
                Some(Ok(re)) => Some(re),
                Some(Err(e)) => {
                    warn!(field = %condition.field, error = %e, "invalid filter regex, condition never matches");
                    None
                }
                None => {
                    warn!(field = %condition.field, "regex condition without a pattern, condition never matches");
                    None
                }
            }
        };

        let test = match condition.operator {
            Operator::Equals => scalar().map(Test::Equals),
            Operator::NotEquals => scalar().map(Test::NotEquals),
            Operator::In => Some(Test::In(list())),
            Operator::NotIn => Some(Test::NotIn(list())),
            Operator::Matches => compiled_pattern().map(Test::Matches),
            Operator::NotMatches => compiled_pattern().map(Test::NotMatches),
            Operator::Contains => scalar().map(Test::Contains),
            Operator::NotContains => scalar().map(Test::NotContains),
        }
        .unwrap_or(Test::Broken);

        Self {
            field: condition.field.clone(),
            test,
        }
    }

    fn evaluate(&self, item: &Item) -> bool {
        let actual = item.field_text(&self.field).to_lowercase();
        match &self.test {
            Test::Equals(expected) => actual == *expected,
            Test::NotEquals(expected) => actual != *expected,
            Test::In(options) => options.iter().any(|o| *o == actual),
            Test::NotIn(options) => !options.iter().any(|o| *o == actual),
            Test::Matches(re) => re.is_match(&actual),
            Test::NotMatches(re) => !re.is_match(&actual),
            Test::Contains(needle) => actual.contains(needle.as_str()),
            Test::NotContains(needle) => !actual.contains(needle.as_str()),
            Test::Broken => false,
        }
    }
}

impl CompiledFilter {
    pub fn compile(spec: &FilterSpec) -> Self {
        Self {
            logic: spec.logic,
            conditions: spec.conditions.iter().map(CompiledCondition::compile).collect(),
        }
    }

    /// An empty condition list accepts everything regardless of logic.
    pub fn matches(&self, item: &Item) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.logic {
            Logic::And => self.conditions.iter().all(|c| c.evaluate(item)),
            Logic::Or => self.conditions.iter().any(|c| c.evaluate(item)),
        }
    }
}

/// Single-item convenience; no spec accepts everything.
pub fn matches(item: &Item, spec: Option<&FilterSpec>) -> bool {
    match spec {
        Some(spec) => CompiledFilter::compile(spec).matches(item),
        None => true,
    }
}

/// Keeps the items accepted by `spec`, preserving order.
pub fn apply(items: Vec<Item>, spec: Option<&FilterSpec>) -> Vec<Item> {
    let Some(spec) = spec else {
        return items;
    };
    let filter = CompiledFilter::compile(spec);
    items.into_iter().filter(|item| filter.matches(item)).collect()
}

/// Regex problems surfaced ahead of persisting a subscription.
pub fn validate(spec: &FilterSpec) -> std::result::Result<(), String> {
    for condition in &spec.conditions {
        if matches!(condition.operator, Operator::Matches | Operator::NotMatches) {
            let pattern = condition
                .pattern
                .clone()
                .or_else(|| condition.value.as_ref().map(path::value_text))
                .ok_or_else(|| format!("condition on '{}' needs a pattern", condition.field))?;
            build_regex(&pattern)
                .map_err(|e| format!("invalid pattern for '{}': {}", condition.field, e))?;
        }
    }
    Ok(())
}
