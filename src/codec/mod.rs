//! Event codec
//!
//! Turns a lifecycle event and its arguments into an [`EventFrame`] and back.
//! Arguments may form arbitrary cyclic graphs; the encoder writes every
//! reachable node exactly once into a flat table and links nodes with
//! `{"$ref": index}` objects:
//!
//! ```text
//! {"eventName": "test",
//!  "args": {"roots": [{"$ref": 0}],
//!           "nodes": [{"title": "adds", "parent": {"$ref": 1}},
//!                     {"title": "math", "tests": {"$ref": 2}},
//!                     [{"$ref": 0}]]}}
//! ```
//!
//! JSON objects never appear inline at value position, so a `{"$ref": n}`
//! object is unambiguous.

pub mod graph;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::json;

use crate::common::{Error, Result};
use crate::protocol::{EventFrame, EventName};

pub use graph::{Graph, Node, NodeId, Value};

/// Key used for node references on the wire
const REF_KEY: &str = "$ref";

/// An outbound event argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Plain data, possibly referencing nodes of the event's graph
    Value(Value),
    /// An error whose fields must all survive the trip
    Error(ErrorInfo),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<NodeId> for Arg {
    fn from(id: NodeId) -> Self {
        Self::Value(Value::Node(id))
    }
}

impl From<ErrorInfo> for Arg {
    fn from(error: ErrorInfo) -> Self {
        Self::Error(error)
    }
}

/// Diagnostic content of an error value
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// Additional fields, e.g. `expected`/`actual` of an assertion; arrays
    /// and objects become graph nodes when the error is prepared
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Capture a Rust error, rendering its source chain as the stack
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        let mut stack = format!("Error: {}", message);
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str(&format!("\n    caused by: {}", cause));
            source = cause.source();
        }
        Self::new(message).with_stack(stack)
    }
}

/// Replace every error argument with a plain map node holding all its fields
///
/// Standard fields (`name`, `message`, `stack`) are written last so a custom
/// field cannot shadow them. The graph is only copied when an error is
/// present.
pub fn prepare_args(graph: &mut Cow<'_, Graph>, args: &[Arg]) -> Result<Vec<Value>> {
    args.iter()
        .map(|arg| match arg {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Error(error) => {
                let graph = graph.to_mut();
                let node = graph.add_map();
                for (key, value) in &error.fields {
                    let value = graph.import(value);
                    graph.set(node, key, value)?;
                }
                graph.set(node, "name", error.name.as_str())?;
                graph.set(node, "message", error.message.as_str())?;
                if let Some(stack) = &error.stack {
                    graph.set(node, "stack", stack.as_str())?;
                }
                Ok(Value::Node(node))
            }
        })
        .collect()
}

/// Encode argument roots and every node reachable from them
pub fn encode_args(graph: &Graph, roots: &[Value]) -> Result<serde_json::Value> {
    let mut encoder = Encoder {
        graph,
        table: HashMap::new(),
        queue: VecDeque::new(),
    };

    let encoded_roots = roots
        .iter()
        .map(|root| encoder.value(root))
        .collect::<Result<Vec<_>>>()?;

    let mut encoded_nodes: Vec<serde_json::Value> = Vec::new();
    while let Some(id) = encoder.queue.pop_front() {
        encoded_nodes.push(encoder.node(id)?);
    }

    Ok(json!({ "roots": encoded_roots, "nodes": encoded_nodes }))
}

/// Breadth-first walk assigning each reachable node one table index
struct Encoder<'g> {
    graph: &'g Graph,
    table: HashMap<NodeId, usize>,
    queue: VecDeque<NodeId>,
}

impl Encoder<'_> {
    fn value(&mut self, value: &Value) -> Result<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Node(id) => {
                let index = self.reference(*id)?;
                json!({ REF_KEY: index })
            }
        })
    }

    fn reference(&mut self, id: NodeId) -> Result<usize> {
        if let Some(index) = self.table.get(&id) {
            return Ok(*index);
        }
        if self.graph.node(id).is_none() {
            return Err(Error::codec(format!("dangling node reference {}", id.0)));
        }
        let index = self.table.len();
        self.table.insert(id, index);
        self.queue.push_back(id);
        Ok(index)
    }

    fn node(&mut self, id: NodeId) -> Result<serde_json::Value> {
        let graph = self.graph;
        match graph.node(id) {
            Some(Node::List(items)) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Some(Node::Map(map)) => {
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    object.insert(key.clone(), self.value(value)?);
                }
                Ok(serde_json::Value::Object(object))
            }
            None => Err(Error::codec(format!("dangling node reference {}", id.0))),
        }
    }
}

/// Decoded arguments: the roots and the graph they point into
#[derive(Debug, Clone, Default)]
pub struct DecodedArgs {
    pub graph: Graph,
    pub roots: Vec<Value>,
}

/// Rebuild a graph from [`encode_args`] output, validating every reference
pub fn decode_args(encoded: &serde_json::Value) -> Result<DecodedArgs> {
    let roots = encoded
        .get("roots")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::codec("args.roots must be an array"))?;
    let nodes = encoded
        .get("nodes")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::codec("args.nodes must be an array"))?;

    let count = nodes.len();
    let mut graph = Graph::new();
    for node in nodes {
        let decoded = match node {
            serde_json::Value::Array(items) => Node::List(
                items
                    .iter()
                    .map(|item| decode_value(item, count))
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(object) => Node::Map(
                object
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), decode_value(value, count)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
            other => return Err(Error::codec(format!("invalid node: {}", other))),
        };
        graph.insert(decoded);
    }

    let roots = roots
        .iter()
        .map(|root| decode_value(root, count))
        .collect::<Result<Vec<_>>>()?;

    Ok(DecodedArgs { graph, roots })
}

fn decode_value(value: &serde_json::Value, count: usize) -> Result<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.clone())),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Object(object) if object.len() == 1 => {
            let index = object
                .get(REF_KEY)
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| Error::codec(format!("invalid reference: {}", value)))?
                as usize;
            if index >= count {
                return Err(Error::codec(format!(
                    "reference {} out of range ({} nodes)",
                    index, count
                )));
            }
            Ok(Value::Node(NodeId(index)))
        }
        other => Err(Error::codec(format!("inline compound value: {}", other))),
    }
}

/// Prepare, encode and serialize a complete event frame
pub fn encode_event(name: EventName, graph: &Graph, args: &[Arg]) -> Result<String> {
    let mut graph = Cow::Borrowed(graph);
    let roots = prepare_args(&mut graph, args)?;
    let frame = EventFrame {
        event_name: name.as_str().to_string(),
        args: encode_args(&graph, &roots)?,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// An event received by the controller
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub name: EventName,
    pub graph: Graph,
    pub args: Vec<Value>,
}

impl DecodedEvent {
    /// First argument as a node, typically the suite/test/hook descriptor
    pub fn subject(&self) -> Option<NodeId> {
        self.args.first().and_then(Value::as_node)
    }
}

/// Parse and decode an event frame
pub fn decode_event(text: &str) -> Result<DecodedEvent> {
    let frame: EventFrame = serde_json::from_str(text)?;
    let name = frame.event_name.parse::<EventName>()?;
    let DecodedArgs { graph, roots } = decode_args(&frame.args)?;
    Ok(DecodedEvent {
        name,
        graph,
        args: roots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_graph_survives_round_trip() {
        let mut graph = Graph::new();
        let suite = graph.add_map();
        let tests = graph.add_list();
        let test = graph.add_map();
        graph.set(suite, "title", "math").unwrap();
        graph.set(suite, "tests", tests).unwrap();
        graph.push(tests, test).unwrap();
        graph.set(test, "title", "adds").unwrap();
        graph.set(test, "parent", suite).unwrap();
        graph.set(test, "self", test).unwrap();

        let roots = vec![Value::Node(test), Value::from(42u64), Value::from("x"), Value::Null];
        let encoded = encode_args(&graph, &roots).unwrap();
        let decoded = decode_args(&encoded).unwrap();

        assert_eq!(decoded.roots.len(), 4);
        for (original, copy) in roots.iter().zip(decoded.roots.iter()) {
            assert!(graph.equivalent(original, &decoded.graph, copy));
        }

        let test_copy = decoded.roots[0].as_node().unwrap();
        assert_eq!(
            decoded.graph.get(test_copy, "self").and_then(Value::as_node),
            Some(test_copy)
        );
    }

    #[test]
    fn test_error_keeps_message_stack_and_custom_fields() {
        let error = ErrorInfo::named("AssertionError", "expected 2 to equal 3")
            .with_stack("AssertionError: expected 2 to equal 3\n    at adds")
            .with_field("expected", 3u64)
            .with_field("actual", 2u64);

        let text = encode_event(EventName::Fail, &Graph::new(), &[Value::Null.into(), error.into()])
            .unwrap();
        let event = decode_event(&text).unwrap();

        assert_eq!(event.name, EventName::Fail);
        let node = event.args[1].as_node().unwrap();
        assert_eq!(event.graph.get_str(node, "name"), Some("AssertionError"));
        assert_eq!(event.graph.get_str(node, "message"), Some("expected 2 to equal 3"));
        assert!(event.graph.get_str(node, "stack").unwrap().contains("at adds"));
        assert_eq!(event.graph.get(node, "expected").and_then(Value::as_u64), Some(3));
        assert_eq!(event.graph.get(node, "actual").and_then(Value::as_u64), Some(2));
    }

    #[test]
    fn test_compound_error_fields_arrive_as_structures() {
        let error = ErrorInfo::named("AssertionError", "expected [1, 2] to deeply equal [1, 3]")
            .with_field("expected", json!([1, 3]))
            .with_field("actual", json!({ "items": [1, 2], "sorted": true }));

        let text = encode_event(EventName::Fail, &Graph::new(), &[error.into()]).unwrap();
        let event = decode_event(&text).unwrap();
        let node = event.args[0].as_node().unwrap();

        let expected = event.graph.get(node, "expected").and_then(Value::as_node).unwrap();
        let items: Vec<u64> = event
            .graph
            .items(expected)
            .iter()
            .filter_map(Value::as_u64)
            .collect();
        assert_eq!(items, vec![1, 3]);

        let actual = event.graph.get(node, "actual").and_then(Value::as_node).unwrap();
        assert_eq!(event.graph.get(actual, "sorted").and_then(Value::as_bool), Some(true));
        let nested = event.graph.get(actual, "items").and_then(Value::as_node).unwrap();
        assert_eq!(event.graph.items(nested).len(), 2);
    }

    #[test]
    fn test_custom_field_cannot_shadow_message() {
        let error = ErrorInfo::new("real").with_field("message", "fake");
        let mut graph = Cow::Owned(Graph::new());
        let roots = prepare_args(&mut graph, &[error.into()]).unwrap();
        let node = roots[0].as_node().unwrap();
        assert_eq!(graph.get_str(node, "message"), Some("real"));
    }

    #[test]
    fn test_plain_arguments_do_not_copy_the_graph() {
        let mut source = Graph::new();
        let test = source.add_map();
        let mut graph = Cow::Borrowed(&source);
        let roots = prepare_args(&mut graph, &[test.into(), Value::from(1u64).into()]).unwrap();
        assert!(matches!(graph, Cow::Borrowed(_)));
        assert_eq!(roots, vec![Value::Node(test), Value::from(1u64)]);
    }

    #[test]
    fn test_from_error_renders_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let outer = Error::Io(inner);
        let info = ErrorInfo::from_error(&outer);
        assert_eq!(info.message, "IO error: disk full");
        assert!(info.stack.unwrap().contains("caused by: disk full"));
    }

    #[test]
    fn test_unreachable_nodes_are_not_encoded() {
        let mut graph = Graph::new();
        let _unused = graph.add_map();
        let used = graph.add_map();
        let encoded = encode_args(&graph, &[Value::Node(used)]).unwrap();
        assert_eq!(encoded["nodes"].as_array().unwrap().len(), 1);
        assert_eq!(encoded["roots"][0]["$ref"], 0);
    }

    #[test]
    fn test_dangling_reference_is_an_error() {
        let graph = Graph::new();
        let err = encode_args(&graph, &[Value::Node(NodeId(3))]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_decode_rejects_out_of_range_reference() {
        let encoded = json!({ "roots": [{ "$ref": 5 }], "nodes": [] });
        assert!(matches!(decode_args(&encoded), Err(Error::Codec(_))));
    }

    #[test]
    fn test_decode_rejects_inline_objects() {
        let encoded = json!({ "roots": [{ "title": "x", "root": true }], "nodes": [] });
        assert!(decode_args(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let text = r#"{"eventName":"retry","args":{"roots":[],"nodes":[]}}"#;
        assert!(matches!(decode_event(text), Err(Error::UnknownEvent(_))));
    }
}
