// Subscriber registry indexed by subject segments.
//
// Patterns:
// - `a.b.c`  exact subject
// - `a.b.*`  trailing wildcard: any subject strictly below `a.b`
// - `*`      every subject
use std::collections::HashMap;

use super::message::Callback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Exact,
    Wildcard,
}

enum Pattern<'a> {
    All,
    Segments(Vec<&'a str>, Kind),
}

fn parse(pattern: &str) -> Pattern<'_> {
    if pattern == "*" {
        return Pattern::All;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => Pattern::Segments(prefix.split('.').collect(), Kind::Wildcard),
        None => Pattern::Segments(pattern.split('.').collect(), Kind::Exact),
    }
}

fn insert_unique(list: &mut Vec<Callback>, callback: Callback) -> bool {
    if list.iter().any(|c| c.same(&callback)) {
        return false;
    }
    list.push(callback);
    true
}

fn remove_one(list: &mut Vec<Callback>, callback: &Callback) -> bool {
    match list.iter().position(|c| c.same(callback)) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    exact: Vec<Callback>,
    wildcard: Vec<Callback>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_empty() && self.wildcard.is_empty()
    }

    fn bucket(&mut self, kind: Kind) -> &mut Vec<Callback> {
        match kind {
            Kind::Exact => &mut self.exact,
            Kind::Wildcard => &mut self.wildcard,
        }
    }

    // Removes `callback` below this node and prunes children left empty.
    fn remove(&mut self, segments: &[&str], kind: Kind, callback: &Callback) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return remove_one(self.bucket(kind), callback);
        };
        let Some(child) = self.children.get_mut(*head) else {
            return false;
        };
        let removed = child.remove(rest, kind, callback);
        if child.is_empty() {
            self.children.remove(*head);
        }
        removed
    }

    fn count_patterns(&self) -> usize {
        let own = usize::from(!self.exact.is_empty()) + usize::from(!self.wildcard.is_empty());
        own + self
            .children
            .values()
            .map(Node::count_patterns)
            .sum::<usize>()
    }

    fn count_callbacks(&self) -> usize {
        self.exact.len()
            + self.wildcard.len()
            + self
                .children
                .values()
                .map(Node::count_callbacks)
                .sum::<usize>()
    }
}

/// Segment trie mapping patterns to ordered callback sets.
#[derive(Default)]
pub(crate) struct SubjectTrie {
    root: Node,
    match_all: Vec<Callback>,
}

impl SubjectTrie {
    /// Returns false when the pair was already registered.
    pub(crate) fn insert(&mut self, pattern: &str, callback: Callback) -> bool {
        match parse(pattern) {
            Pattern::All => insert_unique(&mut self.match_all, callback),
            Pattern::Segments(segments, kind) => {
                let mut node = &mut self.root;
                for seg in segments {
                    node = node.children.entry(seg.to_string()).or_default();
                }
                insert_unique(node.bucket(kind), callback)
            }
        }
    }

    /// Returns false when the pair was not registered.
    pub(crate) fn remove(&mut self, pattern: &str, callback: &Callback) -> bool {
        match parse(pattern) {
            Pattern::All => remove_one(&mut self.match_all, callback),
            Pattern::Segments(segments, kind) => self.root.remove(&segments, kind, callback),
        }
    }

    /// Callbacks for `subject`: exact first, then wildcards from the
    /// shallowest prefix down, then match-all. Registration order within each.
    pub(crate) fn matches(&self, subject: &str) -> Vec<Callback> {
        let segments: Vec<&str> = subject.split('.').collect();
        let mut exact = Vec::new();
        let mut wildcard = Vec::new();

        let mut node = &self.root;
        for (depth, seg) in segments.iter().enumerate() {
            match node.children.get(*seg) {
                Some(child) => node = child,
                None => break,
            }
            if depth + 1 < segments.len() {
                wildcard.extend(node.wildcard.iter().cloned());
            } else {
                exact.extend(node.exact.iter().cloned());
            }
        }

        exact.extend(wildcard);
        exact.extend(self.match_all.iter().cloned());
        exact
    }

    pub(crate) fn pattern_count(&self) -> usize {
        self.root.count_patterns() + usize::from(!self.match_all.is_empty())
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.root.count_callbacks() + self.match_all.len()
    }
}
