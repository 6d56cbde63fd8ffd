//! Extraction and coercion of declared handler arguments.
//!
//! Path captures are required: a spec naming a group the matched template
//! does not capture is a service misconfiguration and fails the request
//! server-side. Query and header parameters fall back to the declared
//! default and then to a neutral value (empty text, zero, or an empty
//! collection). Captured path values are percent-decoded here, not during
//! matching; query values are decoded by the form parser.

use std::collections::{BTreeSet, HashMap};

use http::request::Parts;
use percent_encoding::percent_decode_str;

use super::{
    error::DispatchError,
    registry::{ParamSource, ParamSpec, ScalarKind, Target},
};

#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("no captured group named {0:?}")]
    MissingGroup(String),
    #[error("parameter {name:?}: cannot interpret {value:?} as {expected}")]
    Coerce {
        name: String,
        value: String,
        expected: &'static str,
    },
    #[error("parameter {0:?} is not valid UTF-8 after decoding")]
    Decode(String),
}

impl BindError {
    pub(crate) fn into_dispatch(self) -> DispatchError {
        match self {
            BindError::MissingGroup(_) => DispatchError::Internal(self.into()),
            other => DispatchError::BadRequest(other.to_string()),
        }
    }
}

/// One coerced argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Text(String),
    Int(i64),
    TextList(Vec<String>),
    IntList(Vec<i64>),
    TextSet(BTreeSet<String>),
    IntSet(BTreeSet<i64>),
    Values(Vec<String>),
}

/// Arguments bound for one invocation, positionally matching the route's
/// parameter specs. The request and responder are handed to the handler
/// separately, ahead of these.
#[derive(Debug, Clone, Default)]
pub struct BoundArgs {
    values: Vec<BoundValue>,
}

impl BoundArgs {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&BoundValue> {
        self.values.get(idx)
    }

    /// The textual scalar at `idx`, or `""` for any other shape.
    pub fn text(&self, idx: usize) -> &str {
        match self.values.get(idx) {
            Some(BoundValue::Text(s)) => s,
            _ => "",
        }
    }

    /// The integer scalar at `idx`, or `0` for any other shape.
    pub fn int(&self, idx: usize) -> i64 {
        match self.values.get(idx) {
            Some(BoundValue::Int(v)) => *v,
            _ => 0,
        }
    }

    /// Raw values of a `Values` or text list argument.
    pub fn raw_values(&self, idx: usize) -> &[String] {
        match self.values.get(idx) {
            Some(BoundValue::Values(v)) | Some(BoundValue::TextList(v)) => v,
            _ => &[],
        }
    }

    /// Renders the elements of the argument at `idx` in their bound order,
    /// separated by `sep`.
    pub fn join(&self, idx: usize, sep: &str) -> String {
        match self.values.get(idx) {
            Some(BoundValue::Text(s)) => s.clone(),
            Some(BoundValue::Int(v)) => v.to_string(),
            Some(BoundValue::TextList(v)) | Some(BoundValue::Values(v)) => v.join(sep),
            Some(BoundValue::IntList(v)) => {
                v.iter().map(i64::to_string).collect::<Vec<_>>().join(sep)
            }
            Some(BoundValue::TextSet(v)) => v.iter().cloned().collect::<Vec<_>>().join(sep),
            Some(BoundValue::IntSet(v)) => {
                v.iter().map(i64::to_string).collect::<Vec<_>>().join(sep)
            }
            None => String::new(),
        }
    }
}

pub(crate) fn bind_args(
    specs: &[ParamSpec],
    groups: &HashMap<String, String>,
    parts: &Parts,
) -> Result<BoundArgs, BindError> {
    let query_pairs: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let mut values = Vec::with_capacity(specs.len());
    for spec in specs {
        let value = match spec.source {
            ParamSource::Path => {
                let raw = groups
                    .get(&spec.name)
                    .ok_or_else(|| BindError::MissingGroup(spec.name.clone()))?;
                let decoded = percent_decode_str(raw)
                    .decode_utf8()
                    .map_err(|_| BindError::Decode(spec.name.clone()))?;
                coerce(spec, vec![decoded.into_owned()])?
            }
            ParamSource::Query => {
                let found: Vec<String> = query_pairs
                    .iter()
                    .filter(|(k, _)| *k == spec.name)
                    .map(|(_, v)| v.clone())
                    .collect();
                bind_with_fallback(spec, found)?
            }
            ParamSource::Header => {
                let mut found = Vec::new();
                for value in parts.headers.get_all(spec.name.as_str()) {
                    found.push(
                        value
                            .to_str()
                            .map_err(|_| BindError::Decode(spec.name.clone()))?
                            .to_string(),
                    );
                }
                bind_with_fallback(spec, found)?
            }
        };
        values.push(value);
    }
    Ok(BoundArgs { values })
}

fn bind_with_fallback(spec: &ParamSpec, found: Vec<String>) -> Result<BoundValue, BindError> {
    if !found.is_empty() {
        return coerce(spec, found);
    }
    if let Some(default) = &spec.default {
        return coerce(spec, vec![default.clone()]);
    }
    Ok(neutral(spec.target))
}

fn neutral(target: Target) -> BoundValue {
    match target {
        Target::Scalar(ScalarKind::Text) => BoundValue::Text(String::new()),
        Target::Scalar(ScalarKind::Int) => BoundValue::Int(0),
        Target::List(ScalarKind::Text) => BoundValue::TextList(Vec::new()),
        Target::List(ScalarKind::Int) => BoundValue::IntList(Vec::new()),
        Target::SortedSet(ScalarKind::Text) => BoundValue::TextSet(BTreeSet::new()),
        Target::SortedSet(ScalarKind::Int) => BoundValue::IntSet(BTreeSet::new()),
        Target::Values => BoundValue::Values(Vec::new()),
    }
}

fn coerce(spec: &ParamSpec, raw: Vec<String>) -> Result<BoundValue, BindError> {
    match spec.target {
        Target::Scalar(ScalarKind::Text) => {
            Ok(BoundValue::Text(raw.into_iter().next().unwrap_or_default()))
        }
        Target::Scalar(ScalarKind::Int) => {
            let first = raw.into_iter().next().unwrap_or_default();
            parse_int(&spec.name, &first).map(BoundValue::Int)
        }
        Target::List(ScalarKind::Text) => Ok(BoundValue::TextList(raw)),
        Target::List(ScalarKind::Int) => raw
            .iter()
            .map(|v| parse_int(&spec.name, v))
            .collect::<Result<Vec<_>, _>>()
            .map(BoundValue::IntList),
        Target::SortedSet(ScalarKind::Text) => Ok(BoundValue::TextSet(raw.into_iter().collect())),
        Target::SortedSet(ScalarKind::Int) => raw
            .iter()
            .map(|v| parse_int(&spec.name, v))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(BoundValue::IntSet),
        Target::Values => Ok(BoundValue::Values(raw)),
    }
}

fn parse_int(name: &str, value: &str) -> Result<i64, BindError> {
    value.trim().parse::<i64>().map_err(|_| BindError::Coerce {
        name: name.to_string(),
        value: value.to_string(),
        expected: "an integer",
    })
}

#[cfg(test)]
mod tests {
    use http::{Method, Request, Version};

    use super::*;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .version(Version::HTTP_11);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn groups(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn path_values_are_percent_decoded_then_coerced() {
        let specs = [ParamSpec::path("title"), ParamSpec::path("n").int()];
        let groups = groups(&[("title", "moby%20dick"), ("n", "42")]);
        let args = bind_args(&specs, &groups, &parts("/x", &[])).unwrap();
        assert_eq!(args.text(0), "moby dick");
        assert_eq!(args.int(1), 42);
    }

    #[test]
    fn missing_path_group_is_server_side() {
        let specs = [ParamSpec::path("nope")];
        let err = bind_args(&specs, &HashMap::new(), &parts("/x", &[])).unwrap_err();
        assert!(matches!(err, BindError::MissingGroup(_)));
        assert!(matches!(err.into_dispatch(), DispatchError::Internal(_)));
    }

    #[test]
    fn query_defaults_and_neutral_values() {
        let specs = [
            ParamSpec::query("num").int().with_default("10"),
            ParamSpec::query("absent"),
            ParamSpec::query("zero").int(),
            ParamSpec::query("many").list(ScalarKind::Text),
        ];
        let args = bind_args(&specs, &HashMap::new(), &parts("/x", &[])).unwrap();
        assert_eq!(args.int(0), 10);
        assert_eq!(args.text(1), "");
        assert_eq!(args.int(2), 0);
        assert_eq!(args.get(3), Some(&BoundValue::TextList(Vec::new())));
    }

    #[test]
    fn sorted_set_dedups_and_orders_naturally() {
        let specs = [ParamSpec::query("id").sorted_set(ScalarKind::Int)];
        let args = bind_args(
            &specs,
            &HashMap::new(),
            &parts("/x?id=30&id=10&id=20&id=30", &[]),
        )
        .unwrap();
        assert_eq!(args.join(0, ","), "10,20,30");
    }

    #[test]
    fn list_preserves_arrival_order() {
        let specs = [ParamSpec::query("id").list(ScalarKind::Int)];
        let args = bind_args(&specs, &HashMap::new(), &parts("/x?id=3&id=1&id=2", &[])).unwrap();
        assert_eq!(args.join(0, ","), "3,1,2");
    }

    #[test]
    fn query_values_are_form_decoded() {
        let specs = [ParamSpec::query("q")];
        let args = bind_args(&specs, &HashMap::new(), &parts("/x?q=a%2Bb+c", &[])).unwrap();
        assert_eq!(args.text(0), "a+b c");
    }

    #[test]
    fn coercion_failure_is_a_bad_request() {
        let specs = [ParamSpec::query("num").int()];
        let err = bind_args(&specs, &HashMap::new(), &parts("/x?num=ten", &[])).unwrap_err();
        assert!(matches!(err.into_dispatch(), DispatchError::BadRequest(_)));
    }

    #[test]
    fn headers_keep_duplicates_in_insertion_order() {
        let specs = [ParamSpec::header("x-tag").values()];
        let args = bind_args(
            &specs,
            &HashMap::new(),
            &parts("/x", &[("x-tag", "b"), ("x-tag", "a"), ("x-tag", "b")]),
        )
        .unwrap();
        assert_eq!(args.raw_values(0), ["b", "a", "b"]);
    }

    #[test]
    fn header_default_applies_when_absent() {
        let specs = [ParamSpec::header("x-lane").with_default("main")];
        let args = bind_args(&specs, &HashMap::new(), &parts("/x", &[])).unwrap();
        assert_eq!(args.text(0), "main");
    }

    #[test]
    fn collection_default_is_a_singleton() {
        let specs = [ParamSpec::query("id").list(ScalarKind::Int).with_default("7")];
        let args = bind_args(&specs, &HashMap::new(), &parts("/x", &[])).unwrap();
        assert_eq!(args.join(0, ","), "7");
    }
}
