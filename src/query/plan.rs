//! Validation of parsed calls into a [`QueryPlan`].
//!
//! Everything not on the allow-list in [`super`] is refused here, before the
//! store is touched. Until the first reshaping stage (`$group`, `$project`,
//! `$count`) field references must name schema fields and literals are
//! coerced to the field's type; after it, documents no longer follow the
//! schema and only literal normalization applies.

use serde_json::{Map, Value};

use super::parser::{parse_expression, Call};
use super::{
    Accumulator, Condition, Expr, Filter, Group, GroupKey, Projection, QueryError, SortKey,
    Stage, COLLECTION_METHODS, CURSOR_METHODS,
};
use crate::schema::{canonical_date, CollectionSchema, ID_FIELD};

/// A validated query: a filter the store evaluates, then in-process stages.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub filter: Filter,
    pub stages: Vec<Stage>,
}

/// Parses and validates a sanitized expression.
pub fn compile(sanitized: &str, schema: &CollectionSchema) -> Result<QueryPlan, QueryError> {
    let calls = parse_expression(sanitized)?;
    plan(&calls, schema)
}

/// Validates a parsed call chain.
pub fn plan(calls: &[Call], schema: &CollectionSchema) -> Result<QueryPlan, QueryError> {
    let (head, chain) = calls
        .split_first()
        .ok_or_else(|| QueryError::Invalid("empty call chain".to_string()))?;
    let mut scope = Scope::new(schema);

    if !COLLECTION_METHODS.contains(&head.method.as_str()) {
        return Err(QueryError::NotPermitted(format!("method `{}`", head.method)));
    }

    match head.method.as_str() {
        "find" | "findOne" => {
            let (filter, projection) = match head.args.as_slice() {
                [] => (Filter::All, None),
                [f] => (scope.filter(f)?, None),
                [f, p] => (scope.filter(f)?, Some(p)),
                _ => return Err(too_many_args(&head.method)),
            };
            let mut cursor = FindCursor::default();
            if let Some(p) = projection {
                cursor.project = Some(p.clone());
            }
            if head.method == "findOne" {
                if let Some(call) = chain.first() {
                    return Err(QueryError::NotPermitted(format!(
                        "cursor method `{}` after findOne",
                        call.method
                    )));
                }
                cursor.limit = Some(1);
            } else {
                for call in chain {
                    cursor.apply(call)?;
                }
            }
            let stages = cursor.into_stages(&scope)?;
            Ok(QueryPlan { filter, stages })
        }
        "aggregate" => {
            only_to_array(chain)?;
            let stages = match head.args.as_slice() {
                [] => Vec::new(),
                [Value::Array(stages)] => stages.clone(),
                [_] => {
                    return Err(QueryError::Invalid(
                        "aggregate expects an array of stages".to_string(),
                    ))
                }
                _ => return Err(too_many_args(&head.method)),
            };
            let mut filter = Filter::All;
            let mut planned = Vec::with_capacity(stages.len());
            for raw in &stages {
                let stage = scope.stage(raw)?;
                match stage {
                    Stage::Match(f) if planned.is_empty() && scope.bound => {
                        filter = filter.and(f);
                    }
                    stage => planned.push(stage),
                }
            }
            Ok(QueryPlan {
                filter,
                stages: planned,
            })
        }
        "countDocuments" => {
            only_to_array(chain)?;
            let filter = match head.args.as_slice() {
                [] => Filter::All,
                [f] => scope.filter(f)?,
                _ => return Err(too_many_args(&head.method)),
            };
            Ok(QueryPlan {
                filter,
                stages: vec![Stage::Count("count".to_string())],
            })
        }
        "distinct" => {
            only_to_array(chain)?;
            let (field, filter) = match head.args.as_slice() {
                [Value::String(field)] => (field, Filter::All),
                [Value::String(field), f] => (field, scope.filter(f)?),
                _ => {
                    return Err(QueryError::Invalid(
                        "distinct expects a field name and an optional filter".to_string(),
                    ))
                }
            };
            scope.check_field(field)?;
            Ok(QueryPlan {
                filter,
                stages: vec![
                    Stage::Group(Group {
                        key: GroupKey::Expr(Expr::Field(field.clone())),
                        accumulators: Vec::new(),
                    }),
                    Stage::Project(Projection::Include {
                        keep_id: false,
                        fields: vec![(field.clone(), Expr::Field(ID_FIELD.to_string()))],
                    }),
                ],
            })
        }
        other => Err(QueryError::NotPermitted(format!("method `{}`", other))),
    }
}

const EXPR_OPERATORS: &[&str] = &[
    "$year",
    "$month",
    "$dayOfMonth",
    "$add",
    "$subtract",
    "$multiply",
    "$divide",
];

fn too_many_args(method: &str) -> QueryError {
    QueryError::Invalid(format!("too many arguments to `{}`", method))
}

fn only_to_array(chain: &[Call]) -> Result<(), QueryError> {
    match chain.iter().find(|c| c.method != "toArray") {
        Some(call) => Err(QueryError::NotPermitted(format!(
            "cursor method `{}` here",
            call.method
        ))),
        None => Ok(()),
    }
}

/// Cursor modifiers collected from a `find` chain. Mongo applies them in a
/// fixed order regardless of how they were chained.
#[derive(Default)]
struct FindCursor {
    sort: Option<Value>,
    skip: Option<usize>,
    limit: Option<usize>,
    project: Option<Value>,
}

impl FindCursor {
    fn apply(&mut self, call: &Call) -> Result<(), QueryError> {
        if !CURSOR_METHODS.contains(&call.method.as_str()) {
            return Err(QueryError::NotPermitted(format!(
                "cursor method `{}`",
                call.method
            )));
        }
        let single = || match call.args.as_slice() {
            [v] => Ok(v),
            _ => Err(QueryError::Invalid(format!(
                "`{}` expects one argument",
                call.method
            ))),
        };
        match call.method.as_str() {
            "sort" => self.sort = Some(single()?.clone()),
            "project" => self.project = Some(single()?.clone()),
            "skip" => self.skip = Some(count_arg(single()?, "skip")?),
            "limit" => {
                let n = count_arg(single()?, "limit")?;
                self.limit = (n > 0).then_some(n);
            }
            _ => {
                if !call.args.is_empty() {
                    return Err(QueryError::Invalid("toArray takes no arguments".to_string()));
                }
            }
        }
        Ok(())
    }

    fn into_stages(self, scope: &Scope<'_>) -> Result<Vec<Stage>, QueryError> {
        let mut stages = Vec::new();
        if let Some(sort) = &self.sort {
            stages.push(Stage::Sort(scope.sort(sort)?));
        }
        if let Some(n) = self.skip {
            stages.push(Stage::Skip(n));
        }
        if let Some(n) = self.limit {
            stages.push(Stage::Limit(n));
        }
        if let Some(project) = &self.project {
            if project.as_object().is_some_and(|m| !m.is_empty()) {
                stages.push(Stage::Project(scope.projection(project)?));
            }
        }
        Ok(stages)
    }
}

fn count_arg(value: &Value, what: &str) -> Result<usize, QueryError> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        })
        .map(|n| n as usize)
        .ok_or_else(|| QueryError::Invalid(format!("{} must be a non-negative integer", what)))
}

/// Validation state: whether documents still follow the schema.
struct Scope<'a> {
    schema: &'a CollectionSchema,
    bound: bool,
}

impl<'a> Scope<'a> {
    fn new(schema: &'a CollectionSchema) -> Self {
        Self {
            schema,
            bound: true,
        }
    }

    fn check_field(&self, path: &str) -> Result<(), QueryError> {
        if path.is_empty() || path.starts_with('$') {
            return Err(QueryError::Invalid(format!("invalid field path `{}`", path)));
        }
        if self.bound && self.schema.field(path).is_none() {
            return Err(QueryError::UnknownField(path.to_string()));
        }
        Ok(())
    }

    fn literal(&self, path: &str, value: &Value) -> Result<Value, QueryError> {
        match self.schema.field(path).filter(|_| self.bound) {
            Some(field) => self
                .schema
                .coerce(field, value)
                .map_err(|e| QueryError::Invalid(e.to_string())),
            None => normalize_literal(value),
        }
    }

    fn stage(&mut self, raw: &Value) -> Result<Stage, QueryError> {
        let (name, body) = single_entry(raw)
            .ok_or_else(|| QueryError::Invalid("each stage must have exactly one key".into()))?;
        match name {
            "$match" => Ok(Stage::Match(self.filter(body)?)),
            "$sort" => Ok(Stage::Sort(self.sort(body)?)),
            "$skip" => Ok(Stage::Skip(count_arg(body, "$skip")?)),
            "$limit" => match count_arg(body, "$limit")? {
                0 => Err(QueryError::Invalid("$limit must be positive".into())),
                n => Ok(Stage::Limit(n)),
            },
            "$group" => {
                let group = self.group(body)?;
                self.bound = false;
                Ok(Stage::Group(group))
            }
            "$project" => {
                let projection = self.projection(body)?;
                self.bound = false;
                Ok(Stage::Project(projection))
            }
            "$count" => {
                let name = body
                    .as_str()
                    .filter(|s| valid_output_name(s))
                    .ok_or_else(|| QueryError::Invalid("$count expects a field name".into()))?;
                self.bound = false;
                Ok(Stage::Count(name.to_string()))
            }
            other => Err(QueryError::NotPermitted(format!("stage `{}`", other))),
        }
    }

    fn filter(&self, raw: &Value) -> Result<Filter, QueryError> {
        let map = raw
            .as_object()
            .ok_or_else(|| QueryError::Invalid("filter must be an object".into()))?;
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            let clause = match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let items = value
                        .as_array()
                        .filter(|a| !a.is_empty())
                        .ok_or_else(|| {
                            QueryError::Invalid(format!("{} expects a non-empty array", key))
                        })?;
                    let parts = items
                        .iter()
                        .map(|f| self.filter(f))
                        .collect::<Result<Vec<_>, _>>()?;
                    match key.as_str() {
                        "$and" => Filter::And(parts),
                        "$or" => Filter::Or(parts),
                        _ => Filter::Nor(parts),
                    }
                }
                k if k.starts_with('$') => {
                    return Err(QueryError::NotPermitted(format!("filter operator `{}`", k)))
                }
                path => self.field_filter(path, value)?,
            };
            clauses.push(clause);
        }
        Ok(match clauses.len() {
            0 => Filter::All,
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        })
    }

    fn field_filter(&self, path: &str, value: &Value) -> Result<Filter, QueryError> {
        self.check_field(path)?;
        let field = |cond| Filter::Field {
            path: path.to_string(),
            cond,
        };

        let ops = match value.as_object() {
            Some(map) if map.keys().any(|k| k.starts_with('$')) && !is_tagged_literal(map) => map,
            _ => return Ok(field(Condition::Eq(self.literal(path, value)?))),
        };
        if ops.keys().any(|k| !k.starts_with('$')) {
            return Err(QueryError::Invalid(format!(
                "cannot mix operators and fields under `{}`",
                path
            )));
        }

        let mut conds = Vec::with_capacity(ops.len());
        for (op, arg) in ops {
            let cond = match op.as_str() {
                "$eq" => Condition::Eq(self.literal(path, arg)?),
                "$ne" => Condition::Ne(self.literal(path, arg)?),
                "$gt" => Condition::Gt(self.literal(path, arg)?),
                "$gte" => Condition::Gte(self.literal(path, arg)?),
                "$lt" => Condition::Lt(self.literal(path, arg)?),
                "$lte" => Condition::Lte(self.literal(path, arg)?),
                "$in" | "$nin" => {
                    let items = arg.as_array().ok_or_else(|| {
                        QueryError::Invalid(format!("{} expects an array", op))
                    })?;
                    let values = items
                        .iter()
                        .map(|v| self.literal(path, v))
                        .collect::<Result<Vec<_>, _>>()?;
                    if op == "$in" {
                        Condition::In(values)
                    } else {
                        Condition::Nin(values)
                    }
                }
                "$exists" => Condition::Exists(match arg {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64() != Some(0.0),
                    _ => return Err(QueryError::Invalid("$exists expects a boolean".into())),
                }),
                other => {
                    return Err(QueryError::NotPermitted(format!(
                        "filter operator `{}`",
                        other
                    )))
                }
            };
            conds.push(field(cond));
        }
        Ok(if conds.len() == 1 {
            conds.remove(0)
        } else {
            Filter::And(conds)
        })
    }

    fn sort(&self, raw: &Value) -> Result<Vec<SortKey>, QueryError> {
        let map = raw
            .as_object()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| QueryError::Invalid("sort expects a non-empty object".into()))?;
        map.iter()
            .map(|(path, dir)| {
                self.check_field(path)?;
                let descending = match dir.as_f64() {
                    Some(d) if d == 1.0 => false,
                    Some(d) if d == -1.0 => true,
                    _ => {
                        return Err(QueryError::Invalid(format!(
                            "sort direction for `{}` must be 1 or -1",
                            path
                        )))
                    }
                };
                Ok(SortKey {
                    path: path.clone(),
                    descending,
                })
            })
            .collect()
    }

    fn expr(&self, raw: &Value) -> Result<Expr, QueryError> {
        match raw {
            Value::String(s) if s.starts_with("$$") => Err(QueryError::NotPermitted(format!(
                "system variable `{}`",
                s
            ))),
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                self.check_field(path)?;
                Ok(Expr::Field(path.to_string()))
            }
            Value::Object(map) if is_tagged_literal(map) => {
                Ok(Expr::Literal(normalize_literal(raw)?))
            }
            Value::Object(_) => {
                let (op, arg) = single_entry(raw)
                    .filter(|(k, _)| k.starts_with('$'))
                    .ok_or_else(|| {
                        QueryError::Invalid(
                            "expression objects must have a single operator".into(),
                        )
                    })?;
                if !EXPR_OPERATORS.contains(&op) {
                    return Err(QueryError::NotPermitted(format!(
                        "expression operator `{}`",
                        op
                    )));
                }
                let mut args = match arg {
                    Value::Array(items) => items
                        .iter()
                        .map(|a| self.expr(a))
                        .collect::<Result<Vec<_>, _>>()?,
                    single => vec![self.expr(single)?],
                };
                match (op, args.len()) {
                    ("$add", _) => Ok(Expr::Add(args)),
                    ("$multiply", _) => Ok(Expr::Multiply(args)),
                    ("$year" | "$month" | "$dayOfMonth", 1) => {
                        let arg = Box::new(args.remove(0));
                        Ok(match op {
                            "$year" => Expr::Year(arg),
                            "$month" => Expr::Month(arg),
                            _ => Expr::DayOfMonth(arg),
                        })
                    }
                    ("$subtract" | "$divide", 2) => {
                        let b = Box::new(args.remove(1));
                        let a = Box::new(args.remove(0));
                        Ok(if op == "$subtract" {
                            Expr::Subtract(a, b)
                        } else {
                            Expr::Divide(a, b)
                        })
                    }
                    (_, n) => Err(QueryError::Invalid(format!(
                        "{} does not take {} argument(s)",
                        op, n
                    ))),
                }
            }
            Value::Array(_) => Err(QueryError::Invalid(
                "array literals are not supported in expressions".into(),
            )),
            scalar => Ok(Expr::Literal(scalar.clone())),
        }
    }

    fn group(&self, raw: &Value) -> Result<Group, QueryError> {
        let map = raw
            .as_object()
            .ok_or_else(|| QueryError::Invalid("$group expects an object".into()))?;
        let key_raw = map
            .get(ID_FIELD)
            .ok_or_else(|| QueryError::Invalid("$group requires an _id".into()))?;

        let key = match key_raw {
            Value::Null => GroupKey::Null,
            Value::Object(fields) if !fields.keys().any(|k| k.starts_with('$')) => {
                let mut parts = Vec::with_capacity(fields.len());
                for (name, expr) in fields {
                    if !valid_output_name(name) {
                        return Err(QueryError::Invalid(format!("invalid group key `{}`", name)));
                    }
                    parts.push((name.clone(), self.expr(expr)?));
                }
                GroupKey::Fields(parts)
            }
            other => GroupKey::Expr(self.expr(other)?),
        };

        let mut accumulators = Vec::new();
        for (name, body) in map.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
            if !valid_output_name(name) {
                return Err(QueryError::Invalid(format!("invalid output field `{}`", name)));
            }
            let (op, arg) = single_entry(body).ok_or_else(|| {
                QueryError::Invalid(format!("accumulator for `{}` must have one operator", name))
            })?;
            let acc = match op {
                "$sum" => Accumulator::Sum(self.expr(arg)?),
                "$avg" => Accumulator::Avg(self.expr(arg)?),
                "$min" => Accumulator::Min(self.expr(arg)?),
                "$max" => Accumulator::Max(self.expr(arg)?),
                "$first" => Accumulator::First(self.expr(arg)?),
                "$last" => Accumulator::Last(self.expr(arg)?),
                "$count" => Accumulator::Count,
                other => {
                    return Err(QueryError::NotPermitted(format!("accumulator `{}`", other)))
                }
            };
            accumulators.push((name.clone(), acc));
        }
        Ok(Group { key, accumulators })
    }

    fn projection(&self, raw: &Value) -> Result<Projection, QueryError> {
        let map = raw
            .as_object()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| QueryError::Invalid("projection expects a non-empty object".into()))?;

        let mut keep_id = true;
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (name, value) in map {
            let flag = match value {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => Some(n.as_f64() != Some(0.0)),
                _ => None,
            };
            match flag {
                Some(false) if name == ID_FIELD => keep_id = false,
                Some(false) => {
                    self.check_field(name)?;
                    exclude.push(name.clone());
                }
                Some(true) => {
                    self.check_field(name)?;
                    include.push((name.clone(), Expr::Field(name.clone())));
                }
                None => {
                    if !valid_output_name(name) {
                        return Err(QueryError::Invalid(format!(
                            "invalid output field `{}`",
                            name
                        )));
                    }
                    include.push((name.clone(), self.expr(value)?));
                }
            }
        }

        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(QueryError::Invalid(
                "projection cannot mix inclusion and exclusion".into(),
            )),
            (true, _) => {
                if !keep_id {
                    exclude.push(ID_FIELD.to_string());
                }
                Ok(Projection::Exclude(exclude))
            }
            (false, true) => Ok(Projection::Include {
                keep_id,
                fields: include,
            }),
        }
    }
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

fn is_tagged_literal(map: &Map<String, Value>) -> bool {
    map.len() == 1 && (map.contains_key("$date") || map.contains_key("$oid"))
}

fn valid_output_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('$') && !name.contains('.')
}

/// Converts parser tags to stored form: `$date` to a canonical date string,
/// `$oid` to its hex string. Applied recursively.
pub fn normalize_literal(value: &Value) -> Result<Value, QueryError> {
    match value {
        Value::Object(map) if is_tagged_literal(map) => {
            match (map.get("$date"), map.get("$oid")) {
                (Some(Value::String(s)), _) => canonical_date(s)
                    .map(Value::String)
                    .map_err(|e| QueryError::Invalid(e.to_string())),
                (_, Some(Value::String(s))) => Ok(Value::String(s.clone())),
                _ => Err(QueryError::Invalid(format!("invalid tagged literal {}", value))),
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), normalize_literal(v)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(normalize_literal)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}
