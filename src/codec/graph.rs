//! Arena-backed value graph
//!
//! Event arguments (suite and test descriptors) point back at each other, so
//! they are stored as nodes in a [`Graph`] and refer to one another by
//! [`NodeId`]. Cycles are ordinary data here: no reference counting, nothing
//! leaks when a graph is dropped.

use std::collections::{BTreeMap, HashSet};

use crate::common::{Error, Result};

/// Handle to a node inside a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in its graph
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single value: either a scalar or a reference to a node
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Node(NodeId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number((n as u64).into())
    }
}

/// Non-finite floats have no JSON form and become `Null`
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A compound value
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Arena of nodes
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node and return its handle
    pub fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Add an empty map node
    pub fn add_map(&mut self) -> NodeId {
        self.insert(Node::Map(BTreeMap::new()))
    }

    /// Add an empty list node
    pub fn add_list(&mut self) -> NodeId {
        self.insert(Node::List(Vec::new()))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Set `key` on a map node
    pub fn set(&mut self, id: NodeId, key: &str, value: impl Into<Value>) -> Result<()> {
        match self.nodes.get_mut(id.0) {
            Some(Node::Map(map)) => {
                map.insert(key.to_string(), value.into());
                Ok(())
            }
            Some(Node::List(_)) => Err(Error::codec(format!("node {} is not a map", id.0))),
            None => Err(Error::codec(format!("node {} does not exist", id.0))),
        }
    }

    /// Append to a list node
    pub fn push(&mut self, id: NodeId, value: impl Into<Value>) -> Result<()> {
        match self.nodes.get_mut(id.0) {
            Some(Node::List(list)) => {
                list.push(value.into());
                Ok(())
            }
            Some(Node::Map(_)) => Err(Error::codec(format!("node {} is not a list", id.0))),
            None => Err(Error::codec(format!("node {} does not exist", id.0))),
        }
    }

    /// Look up `key` on a map node
    pub fn get(&self, id: NodeId, key: &str) -> Option<&Value> {
        match self.node(id)? {
            Node::Map(map) => map.get(key),
            Node::List(_) => None,
        }
    }

    pub fn get_str(&self, id: NodeId, key: &str) -> Option<&str> {
        self.get(id, key).and_then(Value::as_str)
    }

    /// Copy a JSON value into the graph, adding a node per array or object
    pub fn import(&mut self, value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                let items = items.iter().map(|item| self.import(item)).collect();
                Value::Node(self.insert(Node::List(items)))
            }
            serde_json::Value::Object(object) => {
                let map = object
                    .iter()
                    .map(|(key, item)| (key.clone(), self.import(item)))
                    .collect();
                Value::Node(self.insert(Node::Map(map)))
            }
        }
    }

    /// Items of a list node, empty for anything else
    pub fn items(&self, id: NodeId) -> &[Value] {
        match self.node(id) {
            Some(Node::List(list)) => list,
            _ => &[],
        }
    }

    /// Structural equality of `a` in `self` and `b` in `other`
    ///
    /// Two node references are equal when their shapes match all the way down;
    /// a pair of nodes already under comparison is assumed equal, which is what
    /// makes cyclic graphs terminate.
    pub fn equivalent(&self, a: &Value, other: &Graph, b: &Value) -> bool {
        let mut assumed: HashSet<(NodeId, NodeId)> = HashSet::new();
        let mut pending: Vec<(&Value, &Value)> = vec![(a, b)];

        while let Some((left, right)) = pending.pop() {
            match (left, right) {
                (Value::Node(x), Value::Node(y)) => {
                    if !assumed.insert((*x, *y)) {
                        continue;
                    }
                    match (self.node(*x), other.node(*y)) {
                        (Some(Node::List(l)), Some(Node::List(r))) => {
                            if l.len() != r.len() {
                                return false;
                            }
                            pending.extend(l.iter().zip(r.iter()));
                        }
                        (Some(Node::Map(l)), Some(Node::Map(r))) => {
                            if l.len() != r.len() || !l.keys().eq(r.keys()) {
                                return false;
                            }
                            pending.extend(l.values().zip(r.values()));
                        }
                        _ => return false,
                    }
                }
                (Value::Node(_), _) | (_, Value::Node(_)) => return false,
                (x, y) => {
                    if x != y {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut graph = Graph::new();
        let suite = graph.add_map();
        graph.set(suite, "title", "math").unwrap();
        graph.set(suite, "root", false).unwrap();

        assert_eq!(graph.get_str(suite, "title"), Some("math"));
        assert_eq!(graph.get(suite, "root").and_then(Value::as_bool), Some(false));
        assert!(graph.get(suite, "missing").is_none());
    }

    #[test]
    fn test_set_on_list_fails() {
        let mut graph = Graph::new();
        let list = graph.add_list();
        assert!(graph.set(list, "key", 1u64).is_err());
        assert!(graph.push(list, 1u64).is_ok());
        assert_eq!(graph.items(list).len(), 1);
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(Value::from(f64::NAN), Value::Null);
        assert!(matches!(Value::from(1.5), Value::Number(_)));
    }

    #[test]
    fn test_equivalent_handles_cycles() {
        let mut a = Graph::new();
        let node_a = a.add_map();
        a.set(node_a, "self", node_a).unwrap();

        let mut b = Graph::new();
        let _padding = b.add_list();
        let node_b = b.add_map();
        b.set(node_b, "self", node_b).unwrap();

        assert!(a.equivalent(&Value::Node(node_a), &b, &Value::Node(node_b)));
    }

    #[test]
    fn test_equivalent_detects_differences() {
        let mut a = Graph::new();
        let node_a = a.add_map();
        a.set(node_a, "title", "one").unwrap();

        let mut b = Graph::new();
        let node_b = b.add_map();
        b.set(node_b, "title", "two").unwrap();

        assert!(!a.equivalent(&Value::Node(node_a), &b, &Value::Node(node_b)));
        assert!(!a.equivalent(&Value::Node(node_a), &b, &Value::Null));
    }
}
