//! The resource registry: handler declarations resolved into an immutable
//! routing table.
//!
//! The registry is built once, before the service starts accepting, by
//! walking every registered [`HandlerSet`]. Declaration mistakes (a bad
//! template, an empty verb set) fail registration; nothing is validated
//! lazily at request time. After startup the registry is shared read-only
//! across all workers.

use std::{collections::HashMap, sync::Arc};

use http::Method;

use super::{
    error::DispatchError,
    handler::{FullBodyHandler, HandlerSet, StreamingHandler},
    router::{PathPattern, PatternError, RouteTrie},
};

/// Where a handler argument is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Path,
    Query,
    Header,
}

/// Scalar element type of a coercion target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Text,
    Int,
}

/// Coercion target for a bound argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Scalar(ScalarKind),
    /// Ordered collection preserving arrival order.
    List(ScalarKind),
    /// Deduplicated collection ordered by the natural order of the
    /// element type.
    SortedSet(ScalarKind),
    /// Raw values, untyped, in arrival order.
    Values,
}

/// Declarative description of one handler argument.
///
/// Every argument names exactly one source; the constructors make any
/// other shape unrepresentable. A declared default is always a single
/// textual value; for collection targets it is wrapped into a singleton
/// list before coercion.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub(crate) source: ParamSource,
    pub(crate) name: String,
    pub(crate) target: Target,
    pub(crate) default: Option<String>,
}

impl ParamSpec {
    fn new(source: ParamSource, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            target: Target::Scalar(ScalarKind::Text),
            default: None,
        }
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::new(ParamSource::Path, name)
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self::new(ParamSource::Query, name)
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::new(ParamSource::Header, name)
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn int(self) -> Self {
        self.target(Target::Scalar(ScalarKind::Int))
    }

    pub fn list(self, kind: ScalarKind) -> Self {
        self.target(Target::List(kind))
    }

    pub fn sorted_set(self, kind: ScalarKind) -> Self {
        self.target(Target::SortedSet(kind))
    }

    pub fn values(self) -> Self {
        self.target(Target::Values)
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// The two body-handling modes a route can declare.
pub enum RouteHandler {
    Full(Arc<dyn FullBodyHandler>),
    Streaming(Arc<dyn StreamingHandler>),
}

impl Clone for RouteHandler {
    fn clone(&self) -> Self {
        match self {
            RouteHandler::Full(h) => RouteHandler::Full(h.clone()),
            RouteHandler::Streaming(h) => RouteHandler::Streaming(h.clone()),
        }
    }
}

/// One declared route: verb set, path template (relative to the handler
/// set's base path), the handler, and argument specs in the positional
/// order the handler reads them.
pub struct RouteSpec {
    pub(crate) methods: Vec<Method>,
    pub(crate) path: String,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) handler: RouteHandler,
}

impl RouteSpec {
    pub fn full(
        methods: impl IntoIterator<Item = Method>,
        path: impl Into<String>,
        handler: Arc<dyn FullBodyHandler>,
    ) -> Self {
        Self {
            methods: methods.into_iter().collect(),
            path: path.into(),
            params: Vec::new(),
            handler: RouteHandler::Full(handler),
        }
    }

    pub fn streaming(
        methods: impl IntoIterator<Item = Method>,
        path: impl Into<String>,
        handler: Arc<dyn StreamingHandler>,
    ) -> Self {
        Self {
            methods: methods.into_iter().collect(),
            path: path.into(),
            params: Vec::new(),
            handler: RouteHandler::Streaming(handler),
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }
}

/// A fully resolved routing table entry.
pub struct ResourceEntry {
    pub(crate) methods: Vec<Method>,
    pub(crate) pattern: PathPattern,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) handler: RouteHandler,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("invalid path template: {0}")]
    Pattern(#[from] PatternError),
    #[error("route {0:?} declares no methods")]
    NoMethods(String),
}

/// A matched entry together with its group bindings.
pub struct RouteMatch {
    pub entry: Arc<ResourceEntry>,
    pub groups: HashMap<String, String>,
}

/// Immutable routing table; shared read-only by every worker.
pub struct ResourceRegistry {
    entries: Vec<Arc<ResourceEntry>>,
    trie: RouteTrie,
}

impl ResourceRegistry {
    pub fn build(handler_sets: &[Arc<dyn HandlerSet>]) -> Result<Self, RegistryError> {
        let mut entries = Vec::new();
        let mut trie = RouteTrie::new();
        for set in handler_sets {
            let base = set.base_path().trim_end_matches('/').to_string();
            for spec in set.routes() {
                if spec.methods.is_empty() {
                    return Err(RegistryError::NoMethods(spec.path));
                }
                let suffix = if spec.path.starts_with('/') {
                    spec.path.clone()
                } else {
                    format!("/{}", spec.path)
                };
                let pattern = PathPattern::compile(&format!("{base}{suffix}"))?;
                trie.insert(pattern.clone());
                entries.push(Arc::new(ResourceEntry {
                    methods: spec.methods,
                    pattern,
                    params: spec.params,
                    handler: spec.handler,
                }));
            }
        }
        Ok(Self { entries, trie })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a request path and method against the table.
    ///
    /// A path that matches at least one template but no template accepting
    /// the method reports [`DispatchError::MethodNotAllowed`]; a path
    /// matching nothing reports [`DispatchError::NotFound`].
    pub fn resolve(&self, path: &str, method: &Method) -> Result<RouteMatch, DispatchError> {
        let candidates = self.trie.matches(path);
        if candidates.is_empty() {
            return Err(DispatchError::NotFound);
        }
        for candidate in candidates {
            let entry = &self.entries[candidate.pattern];
            if entry.methods.contains(method) {
                return Ok(RouteMatch {
                    entry: entry.clone(),
                    groups: candidate.groups,
                });
            }
        }
        Err(DispatchError::MethodNotAllowed)
    }
}
