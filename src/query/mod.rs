//! The closed query grammar.
//!
//! Generated queries are never evaluated as code. The sanitized expression is
//! parsed into a chain of method calls with literal arguments
//! ([`parser`]), validated against an allow-list and the collection schema
//! into a [`QueryPlan`] ([`plan`]), and run by the executor: the plan's
//! filter goes to the store, the remaining stages are evaluated in process
//! ([`eval`]).
//!
//! # Permitted operations
//!
//! | Kind | Allowed |
//! |------|---------|
//! | Collection methods | `find`, `findOne`, `aggregate`, `countDocuments`, `distinct` |
//! | Cursor methods | `sort`, `limit`, `skip`, `project`, `toArray` |
//! | Pipeline stages | `$match`, `$group`, `$project`, `$sort`, `$limit`, `$skip`, `$count` |
//! | Filter operators | `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$and`, `$or`, `$nor` |
//! | Expressions | `"$field"`, literals, `$year`, `$month`, `$dayOfMonth`, `$add`, `$subtract`, `$multiply`, `$divide` |
//! | Accumulators | `$sum`, `$avg`, `$min`, `$max`, `$first`, `$last`, `$count` |

pub mod eval;
pub mod parser;
pub mod plan;

use serde_json::Value;
use thiserror::Error;

pub use parser::{parse_expression, Call};
pub use plan::{compile, QueryPlan};

pub const COLLECTION_METHODS: &[&str] =
    &["find", "findOne", "aggregate", "countDocuments", "distinct"];
pub const CURSOR_METHODS: &[&str] = &["sort", "limit", "skip", "project", "toArray"];
pub const PIPELINE_STAGES: &[&str] = &[
    "$match", "$group", "$project", "$sort", "$limit", "$skip", "$count",
];

/// Why a generated query was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("{0} is not permitted")]
    NotPermitted(String),

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("invalid query: {0}")]
    Invalid(String),
}

/// Row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, cond: Condition },
}

impl Filter {
    /// Conjunction that flattens `All` away.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }
}

/// Comparison applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// Present and not null.
    Exists(bool),
}

/// Computed value inside `$group` and `$project`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    Literal(Value),
    Year(Box<Expr>),
    Month(Box<Expr>),
    DayOfMonth(Box<Expr>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    Null,
    Expr(Expr),
    Fields(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include {
        keep_id: bool,
        fields: Vec<(String, Expr)>,
    },
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

/// One in-process step applied after the store scan.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Group(Group),
    Project(Projection),
    Sort(Vec<SortKey>),
    Skip(usize),
    Limit(usize),
    /// Replaces the stream with a single `{name: count}` document.
    Count(String),
}
