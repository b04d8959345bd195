//! The schemaless payload carried by every message: an ordered tree of
//! string values addressed by dotted paths such as `sc.collects.collect`.
//!
//! Child lists keep insertion order and allow duplicate keys; path lookups
//! resolve to the first matching child at each level.

use serde::{Deserialize, Serialize};

use super::error::MessageError;

/// One node of the payload tree. The root of a message payload is itself a
/// node with no value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<(String, PayloadTree)>,
}

impl PayloadTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf node holding a single value.
    pub fn leaf(value: impl ToString) -> Self {
        Self { value: Some(value.to_string()), children: Vec::new() }
    }

    /// This node's own value, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: impl ToString) {
        self.value = Some(value.to_string());
    }

    /// True if the node has no value and no children.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Sets the value at a dotted path, creating intermediate nodes. If a
    /// node already exists at each step (first match), it is reused.
    pub fn put(&mut self, path: &str, value: impl ToString) {
        self.node_mut(path).value = Some(value.to_string());
    }

    /// The value at a dotted path, following first matches.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.subtree(path).and_then(|node| node.value())
    }

    /// The value at a dotted path, parsed into `T`.
    pub fn get_parsed<T: std::str::FromStr>(&self, path: &str) -> Result<T, MessageError> {
        let raw = self
            .get(path)
            .ok_or_else(|| MessageError::MissingField { path: path.to_string() })?;
        raw.parse().map_err(|_| MessageError::BadField {
            path: path.to_string(),
            value: raw.to_string(),
        })
    }

    /// Appends `child` under the dotted path, keeping any existing children
    /// with the same key. This is how repeated groups are built.
    pub fn add_child(&mut self, path: &str, key: impl ToString, child: PayloadTree) {
        self.node_mut(path).children.push((key.to_string(), child));
    }

    /// The first node at a dotted path; the empty path is this node.
    pub fn subtree(&self, path: &str) -> Option<&PayloadTree> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in path.split('.') {
            node = node
                .children
                .iter()
                .find(|(key, _)| key == part)
                .map(|(_, child)| child)?;
        }
        Some(node)
    }

    /// The ordered children of the node at a dotted path; empty if the path
    /// does not resolve.
    pub fn children_of(&self, path: &str) -> &[(String, PayloadTree)] {
        match self.subtree(path) {
            Some(node) => &node.children,
            None => &[],
        }
    }

    /// The ordered children of this node.
    pub fn children(&self) -> &[(String, PayloadTree)] {
        &self.children
    }

    fn node_mut(&mut self, path: &str) -> &mut PayloadTree {
        if path.is_empty() {
            return self;
        }
        let mut node = self;
        for part in path.split('.') {
            let found = node.children.iter().position(|(key, _)| key == part);
            let index = match found {
                Some(index) => index,
                None => {
                    node.children.push((part.to_string(), PayloadTree::new()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index].1;
        }
        node
    }
}
