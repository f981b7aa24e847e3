//! Stream version predicates for conditional writes
//!
//! A [`Condition`] is an expression tree over a totally ordered domain,
//! used to guard writes against the current version of an event stream.
//! Conditions can be evaluated in memory, rendered as English for error
//! messages, and translated into a MongoDB query document so the server
//! can enforce them as well.
//!
//! # Example
//!
//! ```rust
//! use eventstore_mongodb::condition::{Condition, WriteCondition};
//!
//! let condition = WriteCondition::stream_version(Condition::and(vec![
//!     Condition::Gte(0),
//!     Condition::Lt(100),
//! ]));
//!
//! assert_eq!(
//!     condition.to_string(),
//!     "to be greater than or equal to 0 and to be less than 100"
//! );
//! ```

use std::fmt;

use mongodb::bson::{doc, Bson, Document};

/// A predicate over a totally ordered comparable domain.
///
/// `And`/`Or` are associative and flatten naturally through construction;
/// an empty `And` is true, an empty `Or` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition<T> {
    /// Equal to the given value
    Eq(T),
    /// Not equal to the given value
    Ne(T),
    /// Less than the given value
    Lt(T),
    /// Less than or equal to the given value
    Lte(T),
    /// Greater than the given value
    Gt(T),
    /// Greater than or equal to the given value
    Gte(T),
    /// All child conditions hold
    And(Vec<Condition<T>>),
    /// At least one child condition holds
    Or(Vec<Condition<T>>),
    /// The child condition does not hold
    Not(Box<Condition<T>>),
}

impl<T> Condition<T> {
    /// All of the given conditions must hold.
    pub fn and(conditions: Vec<Condition<T>>) -> Self {
        Condition::And(conditions)
    }

    /// At least one of the given conditions must hold.
    pub fn or(conditions: Vec<Condition<T>>) -> Self {
        Condition::Or(conditions)
    }

    /// The given condition must not hold.
    pub fn not(condition: Condition<T>) -> Self {
        Condition::Not(Box::new(condition))
    }
}

impl<T: PartialOrd> Condition<T> {
    /// Evaluate this condition against an actual value.
    pub fn matches(&self, actual: &T) -> bool {
        match self {
            Condition::Eq(v) => actual == v,
            Condition::Ne(v) => actual != v,
            Condition::Lt(v) => actual < v,
            Condition::Lte(v) => actual <= v,
            Condition::Gt(v) => actual > v,
            Condition::Gte(v) => actual >= v,
            Condition::And(cs) => cs.iter().all(|c| c.matches(actual)),
            Condition::Or(cs) => cs.iter().any(|c| c.matches(actual)),
            Condition::Not(c) => !c.matches(actual),
        }
    }
}

impl<T: Clone> Condition<T> {
    /// The logical negation of this condition, with `Not` pushed down to the
    /// leaves (De Morgan) so that the result contains no `Not` nodes.
    ///
    /// MongoDB's `$not` only applies to operator expressions, so the query
    /// translation eliminates `Not` through this rewrite instead.
    pub fn negate(&self) -> Condition<T> {
        match self {
            Condition::Eq(v) => Condition::Ne(v.clone()),
            Condition::Ne(v) => Condition::Eq(v.clone()),
            Condition::Lt(v) => Condition::Gte(v.clone()),
            Condition::Lte(v) => Condition::Gt(v.clone()),
            Condition::Gt(v) => Condition::Lte(v.clone()),
            Condition::Gte(v) => Condition::Lt(v.clone()),
            Condition::And(cs) => Condition::Or(cs.iter().map(Condition::negate).collect()),
            Condition::Or(cs) => Condition::And(cs.iter().map(Condition::negate).collect()),
            Condition::Not(c) => (**c).clone(),
        }
    }
}

impl Condition<u64> {
    /// Translate this condition into a MongoDB filter on `field`.
    ///
    /// Values are stored as BSON `i64`. An empty `And` matches every
    /// document, an empty `Or` matches none.
    pub fn to_filter(&self, field: &str) -> Document {
        match self {
            Condition::Eq(v) => doc! { field: { "$eq": *v as i64 } },
            Condition::Ne(v) => doc! { field: { "$ne": *v as i64 } },
            Condition::Lt(v) => doc! { field: { "$lt": *v as i64 } },
            Condition::Lte(v) => doc! { field: { "$lte": *v as i64 } },
            Condition::Gt(v) => doc! { field: { "$gt": *v as i64 } },
            Condition::Gte(v) => doc! { field: { "$gte": *v as i64 } },
            Condition::And(cs) if cs.is_empty() => doc! {},
            Condition::And(cs) => {
                let children: Vec<Bson> = cs.iter().map(|c| c.to_filter(field).into()).collect();
                doc! { "$and": children }
            }
            Condition::Or(cs) if cs.is_empty() => doc! { field: { "$in": [] } },
            Condition::Or(cs) => {
                let children: Vec<Bson> = cs.iter().map(|c| c.to_filter(field).into()).collect();
                doc! { "$or": children }
            }
            Condition::Not(c) => c.negate().to_filter(field),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Eq(v) => write!(f, "to be equal to {v}"),
            Condition::Ne(v) => write!(f, "to not be equal to {v}"),
            Condition::Lt(v) => write!(f, "to be less than {v}"),
            Condition::Lte(v) => write!(f, "to be less than or equal to {v}"),
            Condition::Gt(v) => write!(f, "to be greater than {v}"),
            Condition::Gte(v) => write!(f, "to be greater than or equal to {v}"),
            Condition::And(cs) => write_joined(f, cs, " and "),
            Condition::Or(cs) => write_joined(f, cs, " or "),
            Condition::Not(c) => write!(f, "not {c}"),
        }
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    conditions: &[Condition<T>],
    separator: &str,
) -> fmt::Result {
    for (i, c) in conditions.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{c}")?;
    }
    Ok(())
}

/// A condition that must hold for a write to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Accept the write regardless of the current stream version.
    AnyStreamVersion,
    /// The current stream version must satisfy the condition.
    StreamVersion(Condition<u64>),
}

impl WriteCondition {
    /// Accept the write regardless of the current stream version.
    pub fn any() -> Self {
        WriteCondition::AnyStreamVersion
    }

    /// The current stream version must satisfy `condition`.
    pub fn stream_version(condition: Condition<u64>) -> Self {
        WriteCondition::StreamVersion(condition)
    }

    /// The current stream version must be exactly `version`.
    ///
    /// Sugar for `stream_version(Condition::Eq(version))`.
    pub fn stream_version_eq(version: u64) -> Self {
        WriteCondition::StreamVersion(Condition::Eq(version))
    }

    /// Evaluate this condition against the actual stream version.
    pub fn matches(&self, actual: u64) -> bool {
        match self {
            WriteCondition::AnyStreamVersion => true,
            WriteCondition::StreamVersion(c) => c.matches(&actual),
        }
    }

    /// Translate this condition into a MongoDB filter on `field`.
    pub fn to_filter(&self, field: &str) -> Document {
        match self {
            WriteCondition::AnyStreamVersion => doc! {},
            WriteCondition::StreamVersion(c) => c.to_filter(field),
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCondition::AnyStreamVersion => f.write_str("any stream version"),
            WriteCondition::StreamVersion(c) => write!(f, "{c}"),
        }
    }
}
