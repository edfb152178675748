//! Evaluation of a part against one in-memory row.
//!
//! Comparisons involving null are false, as in SQL's WHERE clause. Existence
//! and subquery terms need another table and cannot be evaluated here.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder, escape};

use crate::datatype::Value;
use crate::error::{PolystoreError, Result};
use crate::operator::Operator;
use crate::part::{Connective, Operand, Part, Predicate, Term};
use crate::record::Row;

lazy_static! {
    static ref REGEX_CACHE: Mutex<HashMap<(String, bool), Regex>> = Mutex::new(HashMap::new());
}

/// Translates a LIKE pattern (`%` any run, `_` any one character) into an
/// anchored regular expression.
pub fn like_to_regex(pattern: &str, case_insensitive: bool) -> String {
    let mut expression = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    for c in pattern.chars() {
        match c {
            '%' => expression.push_str(".*"),
            '_' => expression.push('.'),
            other => expression.push_str(&escape(&other.to_string())),
        }
    }
    expression.push('$');
    expression
}

/// Compiles `expression` once per process and hands out clones of it.
pub fn cached_regex(expression: &str, case_insensitive: bool) -> Result<Regex> {
    let mut cache = REGEX_CACHE
        .lock()
        .map_err(|e| PolystoreError::Lock(e.to_string()))?;
    let key = (expression.to_string(), case_insensitive);
    if let Some(regex) = cache.get(&key) {
        return Ok(regex.clone());
    }
    let regex = RegexBuilder::new(expression)
        .case_insensitive(case_insensitive)
        .build()?;
    cache.insert(key, regex.clone());
    Ok(regex)
}

pub fn like_matches(pattern: &str, text: &str, case_insensitive: bool) -> Result<bool> {
    let regex = cached_regex(&like_to_regex(pattern, case_insensitive), false)?;
    Ok(regex.is_match(text))
}

impl Part {
    pub fn matches(&self, row: &impl Row) -> Result<bool> {
        match self {
            Part::Term(term) => term.matches(row),
            Part::Predicate(predicate) => predicate.matches(row),
        }
    }
}

impl Predicate {
    pub fn matches(&self, row: &impl Row) -> Result<bool> {
        match self.connective() {
            Connective::None => Ok(true),
            Connective::And => {
                for part in self.parts() {
                    if !part.matches(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Connective::Or => {
                for part in self.parts() {
                    if part.matches(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

impl Term {
    pub fn matches(&self, row: &impl Row) -> Result<bool> {
        let operator = self.operator();
        if let Operand::Nested(_) = self.operand() {
            return Err(PolystoreError::unsupported(
                "in-memory",
                format!("{} over a subquery needs the referenced table", operator),
            ));
        }
        if operator == Operator::Within {
            return self.within(row);
        }
        let value = row.value(self.column()).unwrap_or(&Value::Null);
        let outcome = match (operator, self.operand()) {
            (Operator::IsNull, _) => value.is_null(),
            (Operator::IsNotNull, _) => !value.is_null(),
            (Operator::NotIn, Operand::List(values)) if values.is_empty() => true,
            _ if value.is_null() => false,
            (Operator::Like | Operator::ILike, Operand::Scalar(Value::Text(pattern))) => {
                like_matches(pattern, &value.to_string(), operator == Operator::ILike)?
            }
            (Operator::Between, Operand::Range(low, high)) => {
                matches!(value.compare(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
            (Operator::In, Operand::List(values)) => contains(values, value),
            (Operator::NotIn, Operand::List(values)) => !contains(values, value),
            (_, Operand::Scalar(other)) if other.is_null() => false,
            (Operator::Equal, Operand::Scalar(other)) => value.compare(other) == Some(Ordering::Equal),
            (Operator::NotEqual, Operand::Scalar(other)) => value.compare(other) != Some(Ordering::Equal),
            (Operator::LessThan, Operand::Scalar(other)) => value.compare(other) == Some(Ordering::Less),
            (Operator::LessOrEqual, Operand::Scalar(other)) => {
                matches!(value.compare(other), Some(Ordering::Less | Ordering::Equal))
            }
            (Operator::GreaterThan, Operand::Scalar(other)) => {
                value.compare(other) == Some(Ordering::Greater)
            }
            (Operator::GreaterOrEqual, Operand::Scalar(other)) => {
                matches!(value.compare(other), Some(Ordering::Greater | Ordering::Equal))
            }
            (operator, operand) => {
                return Err(PolystoreError::shape(
                    operator,
                    format!("cannot be evaluated against {:?}", operand),
                ));
            }
        };
        Ok(outcome)
    }

    fn within(&self, row: &impl Row) -> Result<bool> {
        let Operand::Point { x, y, radius } = self.operand() else {
            return Err(PolystoreError::shape(self.operator(), "requires x, y and radius"));
        };
        let mut axes = self.column().split(',').map(str::trim);
        let coordinate = |axis: Option<&str>| {
            axis.and_then(|axis| row.value(axis)).and_then(Value::as_f64)
        };
        let (px, py) = match (coordinate(axes.next()), coordinate(axes.next())) {
            (Some(px), Some(py)) => (px, py),
            _ => return Ok(false),
        };
        let (cx, cy, r) = match (x.as_f64(), y.as_f64(), radius.as_f64()) {
            (Some(cx), Some(cy), Some(r)) => (cx, cy, r),
            _ => return Ok(false),
        };
        Ok((px - cx).powi(2) + (py - cy).powi(2) <= r * r)
    }
}

fn contains(values: &[Value], value: &Value) -> bool {
    values
        .iter()
        .any(|candidate| value.compare(candidate) == Some(Ordering::Equal))
}
