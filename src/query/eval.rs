//! In-process evaluation of filters, expressions and pipeline stages.
//!
//! Comparison follows a small, fixed model: numbers compare as `f64`,
//! strings byte-wise, booleans false before true, and values of different
//! types never satisfy a range operator. A missing field and an explicit
//! `null` are the same thing for every operator.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Datelike;
use serde_json::{Number, Value};

use super::{Accumulator, Condition, Expr, Filter, Group, GroupKey, Projection, SortKey, Stage};
use crate::models::Document;
use crate::schema::{parse_date, ID_FIELD};

/// Looks up a dotted path through nested objects.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Renders an `f64` the way stored numbers are rendered: integral values
/// without a fractional part. Non-finite results become `null`.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Orders two values of the same scalar type; `None` across types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used by `$sort`, `$min` and `$max`.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| {
            if x.is_object() || x.is_array() {
                x.to_string().cmp(&y.to_string())
            } else {
                Ordering::Equal
            }
        }),
        _ => Ordering::Equal,
    })
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
            Filter::Nor(parts) => !parts.iter().any(|f| f.matches(doc)),
            Filter::Field { path, cond } => cond.matches(get_path(doc, path)),
        }
    }
}

impl Condition {
    /// Tests a field value; `None` means the field is missing.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let present = value.filter(|v| !v.is_null());
        let cmp = |target: &Value| present.and_then(|v| compare_values(v, target));
        match self {
            Condition::Eq(target) => eq_matches(present, target),
            Condition::Ne(target) => !eq_matches(present, target),
            Condition::Gt(target) => cmp(target) == Some(Ordering::Greater),
            Condition::Gte(target) => {
                matches!(cmp(target), Some(Ordering::Greater | Ordering::Equal))
            }
            Condition::Lt(target) => cmp(target) == Some(Ordering::Less),
            Condition::Lte(target) => matches!(cmp(target), Some(Ordering::Less | Ordering::Equal)),
            Condition::In(list) => list.iter().any(|t| eq_matches(present, t)),
            Condition::Nin(list) => !list.iter().any(|t| eq_matches(present, t)),
            Condition::Exists(wanted) => present.is_some() == *wanted,
        }
    }
}

fn eq_matches(present: Option<&Value>, target: &Value) -> bool {
    match present {
        None => target.is_null(),
        Some(v) => values_equal(v, target),
    }
}

impl Expr {
    pub fn eval(&self, doc: &Document) -> Value {
        match self {
            Expr::Field(path) => get_path(doc, path).cloned().unwrap_or(Value::Null),
            Expr::Literal(v) => v.clone(),
            Expr::Year(inner) => date_part(inner.eval(doc), |d| d.year() as i64),
            Expr::Month(inner) => date_part(inner.eval(doc), |d| d.month() as i64),
            Expr::DayOfMonth(inner) => date_part(inner.eval(doc), |d| d.day() as i64),
            Expr::Add(args) => fold_numbers(args, doc, 0.0, |a, b| a + b),
            Expr::Multiply(args) => fold_numbers(args, doc, 1.0, |a, b| a * b),
            Expr::Subtract(a, b) => match (a.eval(doc), b.eval(doc)) {
                (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => number_value(x - y),
                    _ => Value::Null,
                },
                // date minus date is the difference in milliseconds
                (Value::String(x), Value::String(y)) => match (parse_date(&x), parse_date(&y)) {
                    (Some(x), Some(y)) => Value::from((x - y).num_milliseconds()),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            Expr::Divide(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(_), Some(y)) if y == 0.0 => Value::Null,
                (Some(x), Some(y)) => number_value(x / y),
                _ => Value::Null,
            },
        }
    }
}

fn date_part(value: Value, part: impl Fn(&chrono::DateTime<chrono::Utc>) -> i64) -> Value {
    value
        .as_str()
        .and_then(parse_date)
        .map(|d| Value::from(part(&d)))
        .unwrap_or(Value::Null)
}

fn fold_numbers(args: &[Expr], doc: &Document, init: f64, op: fn(f64, f64) -> f64) -> Value {
    let mut acc = init;
    for arg in args {
        match arg.eval(doc).as_f64() {
            Some(n) => acc = op(acc, n),
            None => return Value::Null,
        }
    }
    number_value(acc)
}

/// Rewrites numbers into their canonical rendering so equal keys hash
/// equally.
fn canonical(value: Value) -> Value {
    match value {
        Value::Number(n) => n.as_f64().map(number_value).unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, canonical(v))).collect()),
        other => other,
    }
}

enum AccState {
    Sum(f64),
    Avg { total: f64, n: usize },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Count(u64),
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Sum(_) => AccState::Sum(0.0),
            Accumulator::Avg(_) => AccState::Avg { total: 0.0, n: 0 },
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
            Accumulator::First(_) => AccState::First(None),
            Accumulator::Last(_) => AccState::Last(Value::Null),
            Accumulator::Count => AccState::Count(0),
        }
    }

    fn update(&mut self, acc: &Accumulator, doc: &Document) {
        let value = match acc {
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e) => e.eval(doc),
            Accumulator::Count => Value::Null,
        };
        match self {
            AccState::Sum(total) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                }
            }
            AccState::Avg { total, n } => {
                if let Some(v) = value.as_f64() {
                    *total += v;
                    *n += 1;
                }
            }
            AccState::Min(best) => {
                if !value.is_null()
                    && best
                        .as_ref()
                        .map_or(true, |b| sort_order(Some(&value), Some(b)) == Ordering::Less)
                {
                    *best = Some(value);
                }
            }
            AccState::Max(best) => {
                if !value.is_null()
                    && best
                        .as_ref()
                        .map_or(true, |b| sort_order(Some(&value), Some(b)) == Ordering::Greater)
                {
                    *best = Some(value);
                }
            }
            AccState::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            AccState::Last(last) => *last = value,
            AccState::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Sum(total) => number_value(total),
            AccState::Avg { n: 0, .. } => Value::Null,
            AccState::Avg { total, n } => number_value(total / n as f64),
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) => v.unwrap_or(Value::Null),
            AccState::Last(v) => v,
            AccState::Count(n) => Value::from(n),
        }
    }
}

fn group_key(key: &GroupKey, doc: &Document) -> Value {
    let value = match key {
        GroupKey::Null => Value::Null,
        GroupKey::Expr(expr) => expr.eval(doc),
        GroupKey::Fields(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, expr)| (name.clone(), expr.eval(doc)))
                .collect(),
        ),
    };
    canonical(value)
}

/// Groups in order of first appearance.
fn run_group(docs: Vec<Document>, group: &Group) -> Vec<Document> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<AccState>)> = Vec::new();

    for doc in &docs {
        let key = group_key(&group.key, doc);
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            let states = group.accumulators.iter().map(|(_, a)| AccState::new(a)).collect();
            groups.push((key, states));
            groups.len() - 1
        });
        let states = &mut groups[slot].1;
        for ((_, acc), state) in group.accumulators.iter().zip(states.iter_mut()) {
            state.update(acc, doc);
        }
    }

    groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::new();
            out.insert(ID_FIELD.to_string(), key);
            for ((name, _), state) in group.accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect()
}

fn project(doc: Document, projection: &Projection) -> Document {
    match projection {
        Projection::Include { keep_id, fields } => {
            let mut out = Document::new();
            if *keep_id {
                if let Some(id) = doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
            }
            for (name, expr) in fields {
                if let Expr::Field(path) = expr {
                    if get_path(&doc, path).is_none() {
                        continue;
                    }
                }
                out.insert(name.clone(), expr.eval(&doc));
            }
            out
        }
        Projection::Exclude(names) => doc
            .into_iter()
            .filter(|(k, _)| !names.contains(k))
            .collect(),
    }
}

fn compare_docs(a: &Document, b: &Document, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = sort_order(get_path(a, &key.path), get_path(b, &key.path));
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Applies stages in order to the scanned documents.
pub fn run_stages(mut docs: Vec<Document>, stages: &[Stage]) -> Vec<Document> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Group(group) => run_group(docs, group),
            Stage::Project(p) => docs.into_iter().map(|d| project(d, p)).collect(),
            Stage::Sort(keys) => {
                docs.sort_by(|a, b| compare_docs(a, b, keys));
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
            Stage::Limit(n) => {
                docs.truncate(*n);
                docs
            }
            Stage::Count(name) => {
                let mut out = Document::new();
                out.insert(name.clone(), Value::from(docs.len() as u64));
                vec![out]
            }
        };
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compile;
    use crate::schema::CollectionSchema;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        [
            json!({"_id": "1", "channel": "A", "platform": "Web", "aum": 100, "revenue": 10.5,
                   "financials_date": "2023-01-15T00:00:00.000Z"}),
            json!({"_id": "2", "channel": "B", "platform": "Web", "aum": 50, "revenue": 4.5,
                   "financials_date": "2023-02-10T00:00:00.000Z"}),
            json!({"_id": "3", "channel": "A", "platform": "App", "aum": 25,
                   "financials_date": "2024-01-01T00:00:00.000Z"}),
            json!({"_id": "4", "channel": null, "platform": "App"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    fn run(text: &str) -> Vec<Value> {
        let plan = compile(text, &CollectionSchema::financials("financials", "_test")).unwrap();
        let scanned: Vec<Document> = docs().into_iter().filter(|d| plan.filter.matches(d)).collect();
        run_stages(scanned, &plan.stages)
            .into_iter()
            .map(Value::Object)
            .collect()
    }

    fn ids(results: &[Value]) -> Vec<&str> {
        results.iter().filter_map(|d| d["_id"].as_str()).collect()
    }

    #[test]
    fn test_null_matches_missing() {
        assert_eq!(ids(&run("__COLLECTION__.find({channel: null})")), vec!["4"]);
        assert_eq!(ids(&run("__COLLECTION__.find({revenue: null})")), vec!["3", "4"]);
        assert_eq!(
            ids(&run("__COLLECTION__.find({revenue: {$ne: null}})")),
            vec!["1", "2"]
        );
        assert_eq!(
            ids(&run("__COLLECTION__.find({channel: {$exists: true}})")),
            vec!["1", "2", "3"]
        );
    }

    #[test]
    fn test_ranges_skip_missing_and_other_types() {
        assert_eq!(ids(&run("__COLLECTION__.find({aum: {$gte: 50}})")), vec!["1", "2"]);
        assert_eq!(ids(&run("__COLLECTION__.find({aum: {$lt: 50}})")), vec!["3"]);
        assert_eq!(
            ids(&run("__COLLECTION__.find({financials_date: {$lt: Date('2023-02-01')}})")),
            vec!["1"]
        );
    }

    #[test]
    fn test_in_nin_and_ne() {
        assert_eq!(
            ids(&run("__COLLECTION__.find({channel: {$in: ['B', null]}})")),
            vec!["2", "4"]
        );
        assert_eq!(
            ids(&run("__COLLECTION__.find({channel: {$nin: ['A']}})")),
            vec!["2", "4"]
        );
        assert_eq!(ids(&run("__COLLECTION__.find({channel: {$ne: 'A'}})")), vec!["2", "4"]);
        assert!(run("__COLLECTION__.find({channel: {$in: []}})").is_empty());
    }

    #[test]
    fn test_group_sum_in_first_appearance_order() {
        let out = run(
            "__COLLECTION__.aggregate([{$group: {_id: '$channel', total: {$sum: '$aum'}, n: {$count: {}}, avg: {$avg: '$revenue'}}}])",
        );
        assert_eq!(
            out,
            vec![
                json!({"_id": "A", "total": 125, "n": 2, "avg": 10.5}),
                json!({"_id": "B", "total": 50, "n": 1, "avg": 4.5}),
                json!({"_id": null, "total": 0, "n": 1, "avg": null}),
            ]
        );
    }

    #[test]
    fn test_group_by_year_then_sort() {
        let out = run(
            "__COLLECTION__.aggregate([
                {$match: {financials_date: {$exists: true}}},
                {$group: {_id: {year: {$year: '$financials_date'}}, aum: {$max: '$aum'}}},
                {$sort: {'_id.year': -1}},
                {$project: {_id: 0, year: '$_id.year', aum: 1}}
            ])",
        );
        assert_eq!(
            out,
            vec![json!({"year": 2024, "aum": 25}), json!({"year": 2023, "aum": 100})]
        );
    }

    #[test]
    fn test_sort_skip_limit_project() {
        let out = run(
            "__COLLECTION__.find({}, {_id: 0, channel: 1}).sort({aum: -1}).skip(1).limit(2)",
        );
        assert_eq!(out, vec![json!({"channel": "B"}), json!({"channel": "A"})]);
    }

    #[test]
    fn test_sort_puts_missing_first_ascending() {
        assert_eq!(
            ids(&run("__COLLECTION__.find().sort({aum: 1})")),
            vec!["4", "3", "2", "1"]
        );
    }

    #[test]
    fn test_count_and_distinct() {
        assert_eq!(
            run("__COLLECTION__.countDocuments({platform: 'Web'})"),
            vec![json!({"count": 2})]
        );
        assert_eq!(
            run("__COLLECTION__.countDocuments({platform: 'TV'})"),
            vec![json!({"count": 0})]
        );
        assert_eq!(
            run("__COLLECTION__.distinct('platform')"),
            vec![json!({"platform": "Web"}), json!({"platform": "App"})]
        );
    }

    #[test]
    fn test_arithmetic() {
        let out = run(
            "__COLLECTION__.aggregate([{$match: {_id: '1'}}, {$project: {_id: 0, ratio: {$divide: ['$revenue', '$aum']}, zero: {$divide: ['$aum', 0]}, sum: {$add: ['$aum', 1, 0.5]}}}])",
        );
        assert_eq!(out, vec![json!({"ratio": 0.105, "zero": null, "sum": 101.5})]);
    }

    #[test]
    fn test_number_value_renders_integers() {
        assert_eq!(number_value(3.0), json!(3));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
    }
}
