//! Request predicates.
//!
//! A [`MockMatcher`] decides whether a mock record applies to a request.
//! Matchers are written as closures by test authors or compiled from the
//! declarative [`RequestPredicate`]s of a config file.

use crate::config::{BodyMatcher, QueryMatcher, RequestPredicate};
use crate::request::RequestView;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type PredicateFn = dyn Fn(&RequestView) -> anyhow::Result<bool> + Send + Sync;

/// Shareable predicate over a [`RequestView`].
#[derive(Clone)]
pub struct MockMatcher {
    predicate: Arc<PredicateFn>,
}

impl fmt::Debug for MockMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MockMatcher(..)")
    }
}

impl MockMatcher {
    /// Matcher from a plain predicate.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RequestView) -> bool + Send + Sync + 'static,
    {
        Self::fallible(move |req| Ok(f(req)))
    }

    /// Matcher whose predicate can fail.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&RequestView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(f),
        }
    }

    /// Evaluate the predicate. A panic inside it is reported as an error.
    pub fn evaluate(&self, request: &RequestView) -> anyhow::Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(request))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "matcher panicked".to_string());
                Err(anyhow::anyhow!("matcher panicked: {}", msg))
            }
        }
    }

    /// Matcher that holds when every predicate holds.
    pub fn from_predicates(predicates: &[RequestPredicate]) -> anyhow::Result<Self> {
        let compiled = predicates
            .iter()
            .map(CompiledPredicate::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(move |req| compiled.iter().all(|p| p.matches(req))))
    }

    /// Holds when the instructions field contains `needle`.
    pub fn instructions_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(move |req| req.instructions().is_some_and(|i| i.contains(&needle)))
    }

    /// Holds when the JSON body has `field` equal to `expected`.
    pub fn json_field(field: impl Into<String>, expected: Value) -> Self {
        let field = field.into();
        Self::new(move |req| req.json().and_then(|j| j.get(&field)) == Some(&expected))
    }

    /// Holds when query parameter `name` equals `value`.
    pub fn query_param(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        Self::new(move |req| req.query().get(&name) == Some(&value))
    }
}

enum CompiledPredicate {
    Query { name: String, matcher: CompiledQuery },
    Body(CompiledBody),
    InstructionsContains(String),
}

enum CompiledQuery {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
}

enum CompiledBody {
    Exact(String),
    Regex(Regex),
    JsonPath(Vec<(jsonpath_rust::JsonPath, Value)>),
    Contains(String),
    Json,
    Empty,
}

impl CompiledPredicate {
    fn compile(predicate: &RequestPredicate) -> anyhow::Result<Self> {
        Ok(match predicate {
            RequestPredicate::Query { name, matcher } => CompiledPredicate::Query {
                name: name.clone(),
                matcher: match matcher {
                    QueryMatcher::Exact { value } => CompiledQuery::Exact(value.clone()),
                    QueryMatcher::Regex { pattern } => CompiledQuery::Regex(Regex::new(pattern)?),
                    QueryMatcher::Present => CompiledQuery::Present,
                    QueryMatcher::Absent => CompiledQuery::Absent,
                },
            },
            RequestPredicate::Body { matcher } => CompiledPredicate::Body(match matcher {
                BodyMatcher::Exact { value } => CompiledBody::Exact(value.clone()),
                BodyMatcher::Regex { pattern } => CompiledBody::Regex(Regex::new(pattern)?),
                BodyMatcher::JsonPath { expressions } => {
                    CompiledBody::JsonPath(compile_json_paths(expressions)?)
                }
                BodyMatcher::Contains { value } => CompiledBody::Contains(value.clone()),
                BodyMatcher::Json => CompiledBody::Json,
                BodyMatcher::Empty => CompiledBody::Empty,
            }),
            RequestPredicate::InstructionsContains { value } => {
                CompiledPredicate::InstructionsContains(value.clone())
            }
        })
    }

    fn matches(&self, req: &RequestView) -> bool {
        match self {
            CompiledPredicate::Query { name, matcher } => matches_query(req.query(), name, matcher),
            CompiledPredicate::Body(matcher) => matches_body(req, matcher),
            CompiledPredicate::InstructionsContains(needle) => {
                req.instructions().is_some_and(|i| i.contains(needle.as_str()))
            }
        }
    }
}

fn compile_json_paths(
    expressions: &HashMap<String, Value>,
) -> anyhow::Result<Vec<(jsonpath_rust::JsonPath, Value)>> {
    expressions
        .iter()
        .map(|(expr, expected)| {
            let path: jsonpath_rust::JsonPath = jsonpath_rust::JsonPath::try_from(expr.as_str())
                .map_err(|e| anyhow::anyhow!("Invalid json path {:?}: {}", expr, e))?;
            Ok((path, expected.clone()))
        })
        .collect()
}

fn matches_query(params: &HashMap<String, String>, name: &str, matcher: &CompiledQuery) -> bool {
    match matcher {
        CompiledQuery::Exact(value) => params.get(name) == Some(value),
        CompiledQuery::Regex(regex) => params.get(name).is_some_and(|v| regex.is_match(v)),
        CompiledQuery::Present => params.contains_key(name),
        CompiledQuery::Absent => !params.contains_key(name),
    }
}

fn matches_body(req: &RequestView, matcher: &CompiledBody) -> bool {
    let body = req.body();

    match matcher {
        CompiledBody::Exact(value) => body == Some(value.as_str()),
        CompiledBody::Regex(regex) => body.is_some_and(|b| regex.is_match(b)),
        CompiledBody::JsonPath(paths) => req
            .json()
            .is_some_and(|json| paths.iter().all(|(path, expected)| matches_json_path(json, path, expected))),
        CompiledBody::Contains(value) => body.is_some_and(|b| b.contains(value.as_str())),
        CompiledBody::Json => req.raw_json().is_some(),
        CompiledBody::Empty => body.map(str::is_empty).unwrap_or(true),
    }
}

fn matches_json_path(json: &Value, path: &jsonpath_rust::JsonPath, expected: &Value) -> bool {
    let found = path.find(json);
    let hits: Vec<&Value> = match &found {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };

    // null expectation only checks that the path resolves.
    if expected.is_null() {
        return !hits.is_empty();
    }
    found == *expected || hits.contains(&expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpMethod, InterceptedRequest};
    use serde_json::json;

    fn post(url: &str, body: Value) -> RequestView {
        RequestView::new(InterceptedRequest::new(HttpMethod::Post, url).with_json(&body))
    }

    fn get(url: &str) -> RequestView {
        RequestView::new(InterceptedRequest::new(HttpMethod::Get, url))
    }

    #[test]
    fn test_closure_matcher() {
        let m = MockMatcher::new(|req| req.url().ends_with("/x"));
        assert!(m.evaluate(&get("https://a.test/x")).unwrap());
        assert!(!m.evaluate(&get("https://a.test/y")).unwrap());
    }

    #[test]
    fn test_failing_matcher_reports_error() {
        let m = MockMatcher::fallible(|_| Err(anyhow::anyhow!("boom")));
        assert!(m.evaluate(&get("https://a.test/x")).is_err());
    }

    #[test]
    fn test_panicking_matcher_reports_error() {
        let m = MockMatcher::new(|req| {
            let body = req.json().unwrap();
            body["x"] == 1
        });
        let err = m.evaluate(&get("https://a.test/x")).unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_instructions_contains_uses_synthesized_field() {
        let m = MockMatcher::instructions_contains("lookup");
        let req = post(
            "https://a.test/llm",
            json!({"messages": [{"content": "please lookup"}, {"content": "this word"}]}),
        );
        assert!(m.evaluate(&req).unwrap());
    }

    #[test]
    fn test_query_predicates() {
        let predicates = vec![
            RequestPredicate::Query {
                name: "id".to_string(),
                matcher: QueryMatcher::Exact {
                    value: "eq.4".to_string(),
                },
            },
            RequestPredicate::Query {
                name: "limit".to_string(),
                matcher: QueryMatcher::Absent,
            },
        ];
        let m = MockMatcher::from_predicates(&predicates).unwrap();
        assert!(m.evaluate(&get("https://d.test/rest/v1/words?id=eq.4")).unwrap());
        assert!(!m.evaluate(&get("https://d.test/rest/v1/words?id=eq.5")).unwrap());
        assert!(!m
            .evaluate(&get("https://d.test/rest/v1/words?id=eq.4&limit=1"))
            .unwrap());
    }

    #[test]
    fn test_query_regex_predicate() {
        let m = MockMatcher::from_predicates(&[RequestPredicate::Query {
            name: "select".to_string(),
            matcher: QueryMatcher::Regex {
                pattern: "^id,".to_string(),
            },
        }])
        .unwrap();
        assert!(m.evaluate(&get("https://d.test/t?select=id,name")).unwrap());
        assert!(!m.evaluate(&get("https://d.test/t?select=name")).unwrap());
    }

    #[test]
    fn test_body_predicates() {
        let json_body = MockMatcher::from_predicates(&[RequestPredicate::Body {
            matcher: BodyMatcher::Json,
        }])
        .unwrap();
        assert!(json_body.evaluate(&post("https://a.test/x", json!({"a": 1}))).unwrap());
        let plain = RequestView::new(
            InterceptedRequest::new(HttpMethod::Post, "https://a.test/x").with_body("not json"),
        );
        assert!(!json_body.evaluate(&plain).unwrap());

        let contains = MockMatcher::from_predicates(&[RequestPredicate::Body {
            matcher: BodyMatcher::Contains {
                value: "\"a\":1".to_string(),
            },
        }])
        .unwrap();
        assert!(contains.evaluate(&post("https://a.test/x", json!({"a": 1}))).unwrap());

        let empty = MockMatcher::from_predicates(&[RequestPredicate::Body {
            matcher: BodyMatcher::Empty,
        }])
        .unwrap();
        assert!(empty.evaluate(&get("https://a.test/x")).unwrap());
    }

    #[test]
    fn test_json_path_predicate() {
        let mut expressions = HashMap::new();
        expressions.insert("$.model".to_string(), json!("small"));
        let m = MockMatcher::from_predicates(&[RequestPredicate::Body {
            matcher: BodyMatcher::JsonPath { expressions },
        }])
        .unwrap();
        assert!(m.evaluate(&post("https://a.test/x", json!({"model": "small"}))).unwrap());
        assert!(!m.evaluate(&post("https://a.test/x", json!({"model": "large"}))).unwrap());
    }

    #[test]
    fn test_json_field_matcher() {
        let m = MockMatcher::json_field("kind", json!("quiz"));
        assert!(m.evaluate(&post("https://a.test/x", json!({"kind": "quiz"}))).unwrap());
        assert!(!m.evaluate(&post("https://a.test/x", json!({"kind": "chat"}))).unwrap());
    }
}
