//! Request routing: method + path to handler chain, with exact, parametric
//! (`:name`), and wildcard (`*rest`) path segments. Ties are broken by
//! specificity — exact beats param beats wildcard, and a deeper match beats
//! a shallower one — per spec §4.6.
//!
//! No teacher module routes HTTP requests (mio is transport-only, and
//! rask-old dispatches on a single fixed handler); the trie shape below is
//! built fresh, following the same `slab`-of-nodes style the registry in
//! `crate::handle` uses for its own indexed storage.

use std::collections::HashMap;

use super::Method;

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
enum Specificity {
    Wildcard,
    Param,
    Exact,
}

enum Segment {
    Exact(String),
    Param(String),
    Wildcard(String),
}

fn classify_segment(raw: &str) -> Segment {
    if let Some(name) = raw.strip_prefix(':') {
        Segment::Param(name.to_string())
    } else if let Some(name) = raw.strip_prefix('*') {
        Segment::Wildcard(name.to_string())
    } else {
        Segment::Exact(raw.to_string())
    }
}

struct Node<H> {
    exact: HashMap<String, Node<H>>,
    param: Option<(String, Box<Node<H>>)>,
    wildcard: Option<(String, H)>,
    handler: Option<H>,
}

impl<H> Default for Node<H> {
    fn default() -> Self {
        Node {
            exact: HashMap::new(),
            param: None,
            wildcard: None,
            handler: None,
        }
    }
}

/// A single matched route: the handler plus any parameters captured from
/// `:name` segments and, if present, the wildcard tail.
pub struct Matched<'a, H> {
    pub handler: &'a H,
    pub params: Vec<(String, String)>,
}

/// A method + path router over handler chains of type `H` (typically a
/// boxed middleware chain; left generic so callers aren't forced into one
/// handler representation).
pub struct Router<H> {
    trees: HashMap<Method, Node<H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Router {
            trees: HashMap::new(),
        }
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` at `pattern`, e.g. `/users/:id` or
    /// `/static/*path`.
    pub fn register(&mut self, method: Method, pattern: &str, handler: H) {
        let tree = self.trees.entry(method).or_default();
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        insert(tree, &segments, handler);
    }

    /// Finds the most specific handler matching `method`/`path`, per spec's
    /// tie-break: exact > param > wildcard, deeper before shallower.
    pub fn route(&self, method: Method, path: &str) -> Option<Matched<'_, H>> {
        let tree = self.trees.get(&method)?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut best: Option<(Vec<Specificity>, &H, Vec<(String, String)>)> = None;
        walk(tree, &segments, Vec::new(), Vec::new(), &mut best);
        best.map(|(_, handler, params)| Matched { handler, params })
    }
}

fn insert<H>(node: &mut Node<H>, segments: &[&str], handler: H) {
    match segments.split_first() {
        None => node.handler = Some(handler),
        Some((head, rest)) => match classify_segment(head) {
            Segment::Exact(name) => {
                let child = node.exact.entry(name).or_default();
                insert(child, rest, handler);
            }
            Segment::Param(name) => {
                let child = node
                    .param
                    .get_or_insert_with(|| (name.clone(), Box::new(Node::default())));
                child.0 = name;
                insert(&mut child.1, rest, handler);
            }
            Segment::Wildcard(name) => {
                node.wildcard = Some((name, handler));
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn walk<'a, H>(
    node: &'a Node<H>,
    segments: &[&str],
    path_so_far: Vec<Specificity>,
    params_so_far: Vec<(String, String)>,
    best: &mut Option<(Vec<Specificity>, &'a H, Vec<(String, String)>)>,
) {
    if segments.is_empty() {
        if let Some(handler) = &node.handler {
            consider(best, path_so_far.clone(), handler, params_so_far.clone());
        }
        if let Some((name, handler)) = &node.wildcard {
            let mut specs = path_so_far.clone();
            specs.push(Specificity::Wildcard);
            let mut params = params_so_far.clone();
            params.push((name.clone(), String::new()));
            consider(best, specs, handler, params);
        }
        return;
    }

    let (head, rest) = segments.split_first().unwrap();

    if let Some(child) = node.exact.get(*head) {
        let mut specs = path_so_far.clone();
        specs.push(Specificity::Exact);
        walk(child, rest, specs, params_so_far.clone(), best);
    }

    if let Some((name, child)) = &node.param {
        let mut specs = path_so_far.clone();
        specs.push(Specificity::Param);
        let mut params = params_so_far.clone();
        params.push((name.clone(), (*head).to_string()));
        walk(child, rest, specs, params, best);
    }

    if let Some((name, handler)) = &node.wildcard {
        let mut specs = path_so_far.clone();
        specs.push(Specificity::Wildcard);
        let mut params = params_so_far.clone();
        params.push((name.clone(), segments.join("/")));
        consider(best, specs, handler, params);
    }
}

fn consider<'a, H>(
    best: &mut Option<(Vec<Specificity>, &'a H, Vec<(String, String)>)>,
    specs: Vec<Specificity>,
    handler: &'a H,
    params: Vec<(String, String)>,
) {
    let depth = specs.len();
    let is_better = match best {
        None => true,
        Some((cur_specs, _, _)) => {
            let cur_depth = cur_specs.len();
            // Deeper always wins regardless of segment-kind mix, then
            // compare segment-by-segment, preferring Exact at the first
            // differing segment (specificity lexicographic from the root).
            depth > cur_depth || (depth == cur_depth && specs > *cur_specs)
        }
    };
    if is_better {
        *best = Some((specs, handler, params));
    }
}
