//! Path patterns and the compiled match tree.
//!
//! Patterns are `/`-separated with three segment forms: literals, named
//! parameters (`:name`), and a trailing wildcard (`*`) consuming the rest
//! of the path. Matching prefers the most specific form at every segment
//! (literal over parameter over wildcard) with backtracking, so the
//! deepest, most-literal pattern wins; equally specific patterns tie-break
//! by registration order.

use std::collections::HashMap;

use crate::router::RoutingError;

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Exact segment text.
    Literal(String),
    /// Named single-segment parameter.
    Param(String),
    /// Trailing wildcard; captures the remaining path under `*`.
    Wildcard,
}

/// A compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a pattern string.
    ///
    /// # Errors
    ///
    /// Rejects patterns that do not start with `/`, empty parameter names,
    /// and wildcards anywhere but the final segment.
    pub fn compile(raw: &str) -> Result<Self, RoutingError> {
        let invalid = |reason: &str| RoutingError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let parts: Vec<&str> = split_path(raw);
        let mut segments = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            if *part == "*" {
                if index != parts.len() - 1 {
                    return Err(invalid("wildcard must be the final segment"));
                }
                segments.push(Segment::Wildcard);
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(invalid("parameter name must not be empty"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal((*part).to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The compiled segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Matches a path directly against this pattern, capturing parameters.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts = split_path(path);
        let mut params = HashMap::new();

        let mut part_index = 0;
        for (segment_index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if parts.get(part_index) != Some(&literal.as_str()) {
                        return None;
                    }
                    part_index += 1;
                }
                Segment::Param(name) => {
                    let value = parts.get(part_index)?;
                    params.insert(name.clone(), (*value).to_string());
                    part_index += 1;
                }
                Segment::Wildcard => {
                    debug_assert_eq!(segment_index, self.segments.len() - 1);
                    params.insert("*".to_string(), parts[part_index..].join("/"));
                    return Some(params);
                }
            }
        }

        (part_index == parts.len()).then_some(params)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A rule reference stored at a tree terminal.
#[derive(Debug, Clone)]
struct TerminalRule {
    order: u64,
    rule_id: String,
    pattern: Pattern,
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    /// Rules terminating exactly at this node, registration order.
    terminals: Vec<TerminalRule>,
    /// Wildcard rules rooted at this node, registration order.
    wildcards: Vec<TerminalRule>,
}

/// The outcome of a tree match: the winning terminal's rules (registration
/// order) and the path parameters implied by its pattern.
#[derive(Debug)]
pub(crate) struct MatchHit {
    /// Candidate rule ids at the winning terminal, in registration order.
    pub rule_ids: Vec<String>,
    /// Captured parameters.
    pub params: HashMap<String, String>,
}

/// Compiled match tree over every registered pattern.
#[derive(Debug, Default)]
pub(crate) struct MatchTree {
    root: Node,
}

impl MatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a rule's pattern with its registration order.
    pub fn insert(&mut self, pattern: &Pattern, order: u64, rule_id: &str) {
        let mut node = &mut self.root;
        let terminal = TerminalRule {
            order,
            rule_id: rule_id.to_string(),
            pattern: pattern.clone(),
        };

        for segment in pattern.segments() {
            match segment {
                Segment::Literal(literal) => {
                    node = node.literals.entry(literal.clone()).or_default();
                }
                Segment::Param(_) => {
                    node = node.param.get_or_insert_with(Box::default);
                }
                Segment::Wildcard => {
                    node.wildcards.push(terminal);
                    node.wildcards.sort_by_key(|t| t.order);
                    return;
                }
            }
        }
        node.terminals.push(terminal);
        node.terminals.sort_by_key(|t| t.order);
    }

    /// Finds the most specific terminal for `path`.
    pub fn find(&self, path: &str) -> Option<MatchHit> {
        let parts = split_path(path);
        let terminals = Self::descend(&self.root, &parts, 0)?;

        // Re-derive parameters from the winning pattern; every rule at one
        // terminal shares the same segment shape.
        let pattern = &terminals.first()?.pattern;
        let params = pattern.matches(path).unwrap_or_default();

        Some(MatchHit {
            rule_ids: terminals.iter().map(|t| t.rule_id.clone()).collect(),
            params,
        })
    }

    /// Depth-first descent trying literal, then parameter, then wildcard.
    fn descend<'a>(node: &'a Node, parts: &[&str], index: usize) -> Option<&'a [TerminalRule]> {
        if index == parts.len() {
            if !node.terminals.is_empty() {
                return Some(&node.terminals);
            }
            if !node.wildcards.is_empty() {
                return Some(&node.wildcards);
            }
            return None;
        }

        if let Some(child) = node.literals.get(parts[index]) {
            if let Some(hit) = Self::descend(child, parts, index + 1) {
                return Some(hit);
            }
        }
        if let Some(child) = &node.param {
            if let Some(hit) = Self::descend(child, parts, index + 1) {
                return Some(hit);
            }
        }
        if !node.wildcards.is_empty() {
            return Some(&node.wildcards);
        }
        None
    }
}
