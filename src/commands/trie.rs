//! Prefix tree with cached subtree counts.
//!
//! Nodes live in an arena and refer to their parent by index, so counts can
//! be recomputed from any node up to the root in O(key length) without
//! owning back-references. Deleting a key only clears its payload; the node
//! stays in place for any descendants.

use std::collections::HashMap;

/// Index of a node inside a [`Trie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

#[derive(Debug)]
struct TrieNode<T> {
    children: HashMap<u8, NodeId>,
    /// Number of payloads in this subtree, including this node's own.
    count: usize,
    payload: Option<T>,
    parent: Option<NodeId>,
}

impl<T> TrieNode<T> {
    fn new(parent: Option<NodeId>) -> Self {
        Self {
            children: HashMap::new(),
            count: 0,
            payload: None,
            parent,
        }
    }
}

/// Byte-keyed trie mapping strings to payloads.
#[derive(Debug)]
pub struct Trie<T> {
    nodes: Vec<TrieNode<T>>,
}

impl<T> Trie<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new(None)],
        }
    }

    fn find(&self, key: &str) -> Option<NodeId> {
        let mut current = ROOT;
        for byte in key.bytes() {
            current = *self.nodes[current.0].children.get(&byte)?;
        }
        Some(current)
    }

    /// Insert `payload` under `key`.
    ///
    /// Never overwrites: if `key` already holds a payload the new one is
    /// handed back as `Err`.
    pub fn insert(&mut self, key: &str, payload: T) -> Result<NodeId, T> {
        let mut current = ROOT;
        for byte in key.bytes() {
            current = match self.nodes[current.0].children.get(&byte) {
                Some(&next) => next,
                None => {
                    let next = NodeId(self.nodes.len());
                    self.nodes.push(TrieNode::new(Some(current)));
                    self.nodes[current.0].children.insert(byte, next);
                    next
                }
            };
        }

        if self.nodes[current.0].payload.is_some() {
            return Err(payload);
        }
        self.nodes[current.0].payload = Some(payload);
        self.update(current);
        Ok(current)
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.find(key)
            .and_then(|id| self.nodes[id.0].payload.as_ref())
    }

    /// Payload stored at a node handed out by [`Trie::insert`].
    #[must_use]
    pub fn get_node(&self, node: NodeId) -> Option<&T> {
        self.nodes.get(node.0).and_then(|n| n.payload.as_ref())
    }

    /// Remove the payload under `key`, leaving the node as a tombstone.
    pub fn delete(&mut self, key: &str) -> Option<T> {
        let node = self.find(key)?;
        self.clear(node)
    }

    /// Remove the payload at `node`, leaving the node as a tombstone.
    pub fn clear(&mut self, node: NodeId) -> Option<T> {
        let payload = self.nodes.get_mut(node.0)?.payload.take()?;
        self.update(node);
        Some(payload)
    }

    /// Number of payloads whose key starts with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.find(prefix).map_or(0, |id| self.nodes[id.0].count)
    }

    /// Every payload whose key starts with `prefix`, in no particular order.
    #[must_use]
    pub fn contents(&self, prefix: &str) -> Vec<&T> {
        let Some(start) = self.find(prefix) else {
            return Vec::new();
        };

        let mut found = Vec::with_capacity(self.nodes[start.0].count);
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            // Tombstoned branches with nothing below them are skipped.
            if node.count == 0 {
                continue;
            }
            if let Some(payload) = &node.payload {
                found.push(payload);
            }
            stack.extend(node.children.values().copied());
        }
        found
    }

    /// Recompute cached counts from `node` up to the root.
    fn update(&mut self, node: NodeId) {
        let mut current = Some(node);
        while let Some(id) = current {
            let entry = &self.nodes[id.0];
            let count = entry
                .children
                .values()
                .map(|child| self.nodes[child.0].count)
                .sum::<usize>()
                + usize::from(entry.payload.is_some());
            self.nodes[id.0].count = count;
            current = self.nodes[id.0].parent;
        }
    }

    /// Total number of nodes, tombstones included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    fn counts_consistent(&self) -> bool {
        self.nodes.iter().all(|node| {
            let expected = node
                .children
                .values()
                .map(|child| self.nodes[child.0].count)
                .sum::<usize>()
                + usize::from(node.payload.is_some());
            node.count == expected
        })
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}
