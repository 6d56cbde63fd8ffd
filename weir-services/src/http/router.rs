//! URL template compilation and path matching.
//!
//! Templates are split on `/` into segments of three kinds: literals,
//! named captures (`{name}`) and a terminal glob (`**`). All templates of
//! a service are compiled into one segment trie; matching an incoming path
//! walks the trie and collects every complete match, ordered by:
//!
//! 1. more matched literal segments first,
//! 2. then fewer captures,
//! 3. then glob-free templates,
//! 4. then registration order.
//!
//! Empty segments produced by doubled or trailing slashes are not
//! collapsed; they match as empty literals. Captured values are the raw
//! path segments; percent-decoding happens later, when arguments are
//! bound.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Capture(String),
    Glob,
}

#[derive(thiserror::Error, Debug)]
pub enum PatternError {
    #[error("`**` may only appear as the final segment of {0:?}")]
    GlobNotLast(String),
    #[error("empty capture name in {0:?}")]
    EmptyCapture(String),
}

/// A compiled URL template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let parts: Vec<&str> = template.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if *part == "**" {
                if i + 1 != parts.len() {
                    return Err(PatternError::GlobNotLast(template.to_string()));
                }
                segments.push(Segment::Glob);
            } else if part.starts_with('{') && part.ends_with('}') && part.len() >= 2 {
                let name = &part[1..part.len() - 1];
                if name.is_empty() {
                    return Err(PatternError::EmptyCapture(template.to_string()));
                }
                segments.push(Segment::Capture(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn capture_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Capture(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Substitutes group values back into the template. `None` for glob
    /// templates or missing groups.
    pub fn reconstruct(&self, groups: &HashMap<String, String>) -> Option<String> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => parts.push(lit.clone()),
                Segment::Capture(name) => parts.push(groups.get(name)?.clone()),
                Segment::Glob => return None,
            }
        }
        Some(parts.join("/"))
    }
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, usize>,
    capture: Option<usize>,
    terminals: Vec<usize>,
    glob_terminals: Vec<usize>,
}

/// One complete match of a path against a registered template.
#[derive(Debug)]
pub struct TrieMatch {
    pub pattern: usize,
    pub groups: HashMap<String, String>,
}

struct Candidate<'a> {
    pattern: usize,
    literals: usize,
    glob: bool,
    values: Vec<&'a str>,
}

/// Segment trie over a set of compiled templates. Pattern ids are handed
/// out in insertion order and double as the final precedence tie-break.
#[derive(Debug)]
pub struct RouteTrie {
    nodes: Vec<Node>,
    patterns: Vec<PathPattern>,
}

impl Default for RouteTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            patterns: Vec::new(),
        }
    }

    fn alloc(&mut self) -> usize {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }

    pub fn insert(&mut self, pattern: PathPattern) -> usize {
        let id = self.patterns.len();
        let mut node = 0usize;
        let mut glob = false;
        for seg in &pattern.segments {
            match seg {
                Segment::Glob => {
                    glob = true;
                    break;
                }
                Segment::Literal(lit) => {
                    node = match self.nodes[node].literals.get(lit) {
                        Some(&next) => next,
                        None => {
                            let next = self.alloc();
                            self.nodes[node].literals.insert(lit.clone(), next);
                            next
                        }
                    };
                }
                Segment::Capture(_) => {
                    node = match self.nodes[node].capture {
                        Some(next) => next,
                        None => {
                            let next = self.alloc();
                            self.nodes[node].capture = Some(next);
                            next
                        }
                    };
                }
            }
        }
        if glob {
            self.nodes[node].glob_terminals.push(id);
        } else {
            self.nodes[node].terminals.push(id);
        }
        self.patterns.push(pattern);
        id
    }

    /// All complete matches for `path`, in precedence order.
    pub fn matches(&self, path: &str) -> Vec<TrieMatch> {
        let segs: Vec<&str> = path.split('/').collect();
        let mut found = Vec::new();
        let mut values = Vec::new();
        self.walk(0, &segs, 0, 0, &mut values, &mut found);
        found.sort_by(|a, b| {
            b.literals
                .cmp(&a.literals)
                .then(a.values.len().cmp(&b.values.len()))
                .then(a.glob.cmp(&b.glob))
                .then(a.pattern.cmp(&b.pattern))
        });
        found
            .into_iter()
            .map(|c| {
                let groups = self.patterns[c.pattern]
                    .capture_names()
                    .map(str::to_string)
                    .zip(c.values.iter().map(|v| v.to_string()))
                    .collect();
                TrieMatch {
                    pattern: c.pattern,
                    groups,
                }
            })
            .collect()
    }

    fn walk<'a>(
        &self,
        node: usize,
        segs: &[&'a str],
        idx: usize,
        literals: usize,
        values: &mut Vec<&'a str>,
        out: &mut Vec<Candidate<'a>>,
    ) {
        let n = &self.nodes[node];
        // a trailing glob swallows the rest of the path, including nothing
        for &pattern in &n.glob_terminals {
            out.push(Candidate {
                pattern,
                literals,
                glob: true,
                values: values.clone(),
            });
        }
        if idx == segs.len() {
            for &pattern in &n.terminals {
                out.push(Candidate {
                    pattern,
                    literals,
                    glob: false,
                    values: values.clone(),
                });
            }
            return;
        }
        if let Some(&child) = n.literals.get(segs[idx]) {
            self.walk(child, segs, idx + 1, literals + 1, values, out);
        }
        if let Some(child) = n.capture {
            values.push(segs[idx]);
            self.walk(child, segs, idx + 1, literals, values, out);
            values.pop();
        }
    }
}
