//! The fixed vocabulary of condition operators.
//!
//! Every operator carries a symbolic token, the number of scalar values it
//! expects, and whether a nested part may stand in for its value list.

use std::fmt;
use std::str::FromStr;

use crate::error::{PolystoreError, Result};

/// Number of scalar values an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Two,
    Three,
    Many,
}

impl Arity {
    /// Whether `count` scalar values satisfy this arity.
    pub fn admits(&self, count: usize) -> bool {
        match self {
            Arity::None => count == 0,
            Arity::One => count == 1,
            Arity::Two => count == 2,
            Arity::Three => count == 3,
            Arity::Many => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    IsNull,
    IsNotNull,
    Like,
    ILike,
    Between,
    In,
    NotIn,
    Exists,
    NotExists,
    Within,
}

impl Operator {
    pub const ALL: [Operator; 16] = [
        Operator::Equal,
        Operator::NotEqual,
        Operator::LessThan,
        Operator::LessOrEqual,
        Operator::GreaterThan,
        Operator::GreaterOrEqual,
        Operator::IsNull,
        Operator::IsNotNull,
        Operator::Like,
        Operator::ILike,
        Operator::Between,
        Operator::In,
        Operator::NotIn,
        Operator::Exists,
        Operator::NotExists,
        Operator::Within,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::LessThan => "<",
            Operator::LessOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
            Operator::Between => "BETWEEN",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Exists => "EXISTS",
            Operator::NotExists => "NOT EXISTS",
            Operator::Within => "WITHIN",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Operator::IsNull | Operator::IsNotNull | Operator::Exists | Operator::NotExists => {
                Arity::None
            }
            Operator::Between => Arity::Two,
            Operator::Within => Arity::Three,
            Operator::In | Operator::NotIn => Arity::Many,
            _ => Arity::One,
        }
    }

    /// Whether a nested part may replace the value list.
    pub fn accepts_subquery(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::Exists | Operator::NotExists
        )
    }

    /// Whether the operator contributes scalar values to the parameter list.
    pub fn takes_value(&self) -> bool {
        self.arity() != Arity::None
    }

    pub fn is_null_test(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }

    pub fn is_existence(&self) -> bool {
        matches!(self, Operator::Exists | Operator::NotExists)
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessOrEqual
                | Operator::GreaterThan
                | Operator::GreaterOrEqual
        )
    }

    /// Looks an operator up by token, ignoring case and surrounding blanks.
    pub fn from_token(token: &str) -> Result<Operator> {
        let normalized = token.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        let operator = match normalized.as_str() {
            "==" => Operator::Equal,
            "!=" => Operator::NotEqual,
            other => Operator::ALL
                .iter()
                .find(|op| op.token() == other)
                .copied()
                .ok_or_else(|| PolystoreError::UnknownOperator(token.to_string()))?,
        };
        Ok(operator)
    }
}

impl FromStr for Operator {
    type Err = PolystoreError;
    fn from_str(s: &str) -> Result<Self> {
        Operator::from_token(s)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}
