//! Client-side evaluation of where clauses against cached objects.
//!
//! Lists use this to decide whether an object written elsewhere belongs in
//! them without a round trip. Operators the client cannot evaluate exactly
//! (full-text search, geo filters, ...) yield [`WhereMatch::Sorta`]: the object
//! might match, so the list must revalidate.
//!
//! Supported shapes:
//!
//! ```json
//! {"name": "Ada"}                               // equality shorthand
//! {"age": {"$gte": 18, "$lt": 65}}              // operators
//! {"$and": [...]}, {"$or": [...]}, {"$not": {...}}
//! ```

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::canonical::compare_json;
use super::object::OsdkObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereMatch {
    Strict,
    Sorta,
    No,
}

impl WhereMatch {
    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::No, _) | (_, Self::No) => Self::No,
            (Self::Sorta, _) | (_, Self::Sorta) => Self::Sorta,
            _ => Self::Strict,
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Strict, _) | (_, Self::Strict) => Self::Strict,
            (Self::Sorta, _) | (_, Self::Sorta) => Self::Sorta,
            _ => Self::No,
        }
    }

    fn not(self) -> Self {
        match self {
            Self::Strict => Self::No,
            Self::No => Self::Strict,
            Self::Sorta => Self::Sorta,
        }
    }

    fn from_bool(value: bool) -> Self {
        if value { Self::Strict } else { Self::No }
    }
}

/// Evaluate `where_clause` against `object`. An empty clause matches everything.
pub fn evaluate(object: &OsdkObject, where_clause: &Value) -> WhereMatch {
    match where_clause {
        Value::Null => WhereMatch::Strict,
        Value::Object(map) => evaluate_map(object, map),
        _ => WhereMatch::Sorta,
    }
}

fn evaluate_map(object: &OsdkObject, map: &Map<String, Value>) -> WhereMatch {
    map.iter()
        .fold(WhereMatch::Strict, |acc, (key, value)| {
            if acc == WhereMatch::No {
                return acc;
            }
            acc.and(evaluate_entry(object, key, value))
        })
}

fn evaluate_entry(object: &OsdkObject, key: &str, value: &Value) -> WhereMatch {
    match key {
        "$and" => match value {
            Value::Array(clauses) => clauses
                .iter()
                .fold(WhereMatch::Strict, |acc, clause| acc.and(evaluate(object, clause))),
            _ => WhereMatch::Sorta,
        },
        "$or" => match value {
            Value::Array(clauses) => clauses
                .iter()
                .fold(WhereMatch::No, |acc, clause| acc.or(evaluate(object, clause))),
            _ => WhereMatch::Sorta,
        },
        "$not" => evaluate(object, value).not(),
        property => evaluate_property(object.property(property).as_ref(), value),
    }
}

fn evaluate_property(actual: Option<&Value>, filter: &Value) -> WhereMatch {
    match filter {
        Value::Object(operators) if operators.keys().all(|key| key.starts_with('$')) => operators
            .iter()
            .fold(WhereMatch::Strict, |acc, (operator, operand)| {
                acc.and(evaluate_operator(actual, operator, operand))
            }),
        expected => WhereMatch::from_bool(actual.is_some_and(|actual| json_eq(actual, expected))),
    }
}

fn evaluate_operator(actual: Option<&Value>, operator: &str, operand: &Value) -> WhereMatch {
    let is_null = matches!(actual, None | Some(Value::Null));
    match operator {
        "$eq" => WhereMatch::from_bool(actual.is_some_and(|actual| json_eq(actual, operand))),
        "$ne" => WhereMatch::from_bool(!actual.is_some_and(|actual| json_eq(actual, operand))),
        "$gt" => compare(actual, operand, |ordering| ordering == Ordering::Greater),
        "$gte" => compare(actual, operand, |ordering| ordering != Ordering::Less),
        "$lt" => compare(actual, operand, |ordering| ordering == Ordering::Less),
        "$lte" => compare(actual, operand, |ordering| ordering != Ordering::Greater),
        "$in" => match operand {
            Value::Array(candidates) => WhereMatch::from_bool(actual.is_some_and(|actual| {
                candidates.iter().any(|candidate| json_eq(actual, candidate))
            })),
            _ => WhereMatch::Sorta,
        },
        "$isNull" => match operand {
            Value::Bool(expected) => WhereMatch::from_bool(is_null == *expected),
            _ => WhereMatch::Sorta,
        },
        "$startsWith" => match (actual, operand) {
            (Some(Value::String(actual)), Value::String(prefix)) => {
                WhereMatch::from_bool(actual.starts_with(prefix.as_str()))
            }
            (None | Some(Value::Null), _) => WhereMatch::No,
            _ => WhereMatch::Sorta,
        },
        "$contains" => match actual {
            Some(Value::Array(items)) => {
                WhereMatch::from_bool(items.iter().any(|item| json_eq(item, operand)))
            }
            None | Some(Value::Null) => WhereMatch::No,
            _ => WhereMatch::Sorta,
        },
        _ => WhereMatch::Sorta,
    }
}

fn compare(
    actual: Option<&Value>,
    operand: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> WhereMatch {
    match (actual, operand) {
        (None | Some(Value::Null), _) => WhereMatch::No,
        (Some(Value::Number(_)), Value::Number(_)) | (Some(Value::String(_)), Value::String(_)) => {
            WhereMatch::from_bool(accept(compare_json(actual, Some(operand))))
        }
        _ => WhereMatch::Sorta,
    }
}

fn json_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(_), Value::Number(_)) => {
            compare_json(Some(actual), Some(expected)) == Ordering::Equal
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ada() -> OsdkObject {
        OsdkObject::new("Employee", 1)
            .with_property("name", "Ada")
            .with_property("age", 36)
            .with_property("tags", json!(["math", "engines"]))
    }

    #[test]
    fn empty_clause_matches() {
        assert_eq!(evaluate(&ada(), &json!({})), WhereMatch::Strict);
        assert_eq!(evaluate(&ada(), &Value::Null), WhereMatch::Strict);
    }

    #[test]
    fn equality_shorthand() {
        assert_eq!(evaluate(&ada(), &json!({"name": "Ada"})), WhereMatch::Strict);
        assert_eq!(evaluate(&ada(), &json!({"name": "Grace"})), WhereMatch::No);
        assert_eq!(evaluate(&ada(), &json!({"age": 36.0})), WhereMatch::Strict);
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(
            evaluate(&ada(), &json!({"age": {"$gte": 18, "$lt": 65}})),
            WhereMatch::Strict
        );
        assert_eq!(evaluate(&ada(), &json!({"age": {"$gt": 40}})), WhereMatch::No);
        assert_eq!(
            evaluate(&ada(), &json!({"missing": {"$isNull": true}})),
            WhereMatch::Strict
        );
        assert_eq!(
            evaluate(&ada(), &json!({"tags": {"$contains": "math"}})),
            WhereMatch::Strict
        );
    }

    #[test]
    fn logical_combinators() {
        assert_eq!(
            evaluate(
                &ada(),
                &json!({"$or": [{"name": "Grace"}, {"age": {"$in": [35, 36]}}]})
            ),
            WhereMatch::Strict
        );
        assert_eq!(
            evaluate(&ada(), &json!({"$not": {"name": "Ada"}})),
            WhereMatch::No
        );
        assert_eq!(
            evaluate(&ada(), &json!({"$and": [{"name": "Ada"}, {"age": 1}]})),
            WhereMatch::No
        );
    }

    #[test]
    fn unevaluable_operators_are_sorta() {
        let clause = json!({"name": {"$containsAnyTerm": "ad"}});
        assert_eq!(evaluate(&ada(), &clause), WhereMatch::Sorta);

        let mixed = json!({"name": "Ada", "location": {"$within": {}}});
        assert_eq!(evaluate(&ada(), &mixed), WhereMatch::Sorta);

        let excluded = json!({"name": "Grace", "location": {"$within": {}}});
        assert_eq!(evaluate(&ada(), &excluded), WhereMatch::No);
    }
}
