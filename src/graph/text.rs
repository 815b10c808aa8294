//! Line-oriented human-readable serialization for [`Graph`].
//!
//! The grammar is intentionally simple: one directive per line, fields
//! separated by single spaces, with attribute bags, shapes, and
//! initializer bytes embedded as compact JSON (via `serde_json`) so the
//! custom parser here only needs to split on whitespace and colons, not
//! reimplement a JSON grammar. This is advisory/debugging output, not a
//! wire format — the round-trip contract is "produces a graph that
//! passes `validate()`", not field-for-field equality. Initializer
//! tensor bytes are the one exception worth carrying through: unlike an
//! execution-produced intermediate, they cannot be recovered by
//! re-running the graph, so `serialize_value` emits them and
//! `parse_value_line` restores them.

use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, Node, Value};
use crate::tensor::Tensor;
use crate::types::{DType, NodeId, Shape, TensorLayout, ValueId};

pub fn serialize(graph: &Graph) -> String {
    let mut out = String::new();

    out.push_str(&format!("graph_inputs {}\n", join_ids(graph.declared_inputs())));
    out.push_str(&format!("graph_outputs {}\n", join_ids(graph.declared_outputs())));

    for value in graph.values() {
        out.push_str(&serialize_value(value));
        out.push('\n');
    }
    for node in graph.nodes() {
        out.push_str(&serialize_node(node));
        out.push('\n');
    }

    out
}

fn join_ids(ids: &[ValueId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn serialize_value(value: &Value) -> String {
    let shape_json = match &value.shape {
        Some(s) => serde_json::to_string(s).unwrap_or_else(|_| "null".to_string()),
        None => "null".to_string(),
    };
    let mut line = format!(
        "value id={} name={} dtype={:?} shape={} layout={:?} initializer={}",
        value.id, value.name, value.dtype, shape_json, value.layout, value.is_initializer
    );
    // Initializer bytes are the one piece of Tensor data worth carrying
    // through this format: unlike an execution-produced intermediate,
    // they are not recoverable by re-running the graph.
    if value.is_initializer {
        if let Some(tensor) = &value.tensor {
            let data_json = serde_json::to_string(&tensor.to_raw_bytes()).unwrap_or_else(|_| "[]".to_string());
            line.push_str(&format!(" data={data_json}"));
        }
    }
    line
}

fn serialize_node(node: &Node) -> String {
    let attrs_json = serde_json::to_string(&node.attributes).unwrap_or_else(|_| "{}".to_string());
    format!(
        "node id={} op={} name={} inputs={} outputs={} attrs={}",
        node.id,
        node.op_type,
        node.name,
        join_ids(&node.inputs),
        join_ids(&node.outputs),
        attrs_json
    )
}

/// Parses the text grammar emitted by [`serialize`] and runs
/// `Graph::validate()` on the result.
pub fn deserialize(input: &str) -> EngineResult<Graph> {
    let mut graph = Graph::new();
    let mut pending_inputs: Vec<ValueId> = Vec::new();
    let mut pending_outputs: Vec<ValueId> = Vec::new();

    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = split_fields(line);
        let directive = fields
            .first()
            .ok_or_else(|| parse_error(lineno, "empty directive"))?;

        match *directive {
            "graph_inputs" => pending_inputs = parse_value_ids(fields.get(1).copied().unwrap_or(""))?,
            "graph_outputs" => pending_outputs = parse_value_ids(fields.get(1).copied().unwrap_or(""))?,
            "value" => parse_value_line(&mut graph, &fields[1..], lineno)?,
            "node" => parse_node_line(&mut graph, &fields[1..], lineno)?,
            other => return Err(parse_error(lineno, &format!("unknown directive '{other}'"))),
        }
    }

    graph.set_declared_inputs(pending_inputs);
    graph.set_declared_outputs(pending_outputs);
    graph.validate()?;
    Ok(graph)
}

fn parse_error(lineno: usize, message: &str) -> EngineError {
    EngineError::invalid_model(format!("graph text parse error at line {}: {message}", lineno + 1))
}

/// Splits `"key=value key2=value2"` preserving the directive token, with
/// no support for spaces inside a value (none of our JSON payloads emit
/// them since `serde_json::to_string` is compact by default).
fn split_fields(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

fn parse_kv(field: &str, lineno: usize) -> EngineResult<(&str, &str)> {
    field
        .split_once('=')
        .ok_or_else(|| parse_error(lineno, &format!("expected key=value, found '{field}'")))
}

fn parse_value_ids(field: &str) -> EngineResult<Vec<ValueId>> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(|tok| parse_value_id(tok))
        .collect()
}

fn parse_value_id(tok: &str) -> EngineResult<ValueId> {
    let digits = tok.strip_prefix('$').unwrap_or(tok);
    digits
        .parse::<u32>()
        .map(ValueId)
        .map_err(|_| EngineError::invalid_model(format!("bad value id '{tok}'")))
}

fn parse_node_id(tok: &str) -> EngineResult<NodeId> {
    let digits = tok.strip_prefix('%').unwrap_or(tok);
    digits
        .parse::<u32>()
        .map(NodeId)
        .map_err(|_| EngineError::invalid_model(format!("bad node id '{tok}'")))
}

fn parse_dtype(s: &str) -> DType {
    match s {
        "Float32" => DType::Float32,
        "Float16" => DType::Float16,
        "Int32" => DType::Int32,
        "Int64" => DType::Int64,
        "Int8" => DType::Int8,
        "Uint8" => DType::Uint8,
        _ => DType::Unknown,
    }
}

fn parse_layout(s: &str) -> TensorLayout {
    match s {
        "Nhwc" => TensorLayout::Nhwc,
        _ => TensorLayout::Nchw,
    }
}

/// Ensures the graph's value slab has at least `id + 1` slots, filling
/// any gap with placeholder values so ids stay index-stable.
fn ensure_value_slot(graph: &mut Graph, id: ValueId) {
    while graph.value_count() <= id.0 as usize {
        graph.add_value();
    }
}

fn parse_value_line(graph: &mut Graph, fields: &[&str], lineno: usize) -> EngineResult<()> {
    let mut id = None;
    let mut name = String::new();
    let mut dtype = DType::Unknown;
    let mut shape: Option<Shape> = None;
    let mut layout = TensorLayout::Nchw;
    let mut is_initializer = false;
    let mut data: Option<Vec<u8>> = None;

    for field in fields {
        let (key, val) = parse_kv(field, lineno)?;
        match key {
            "id" => id = Some(parse_value_id(val)?),
            "name" => name = val.to_string(),
            "dtype" => dtype = parse_dtype(val),
            "shape" => shape = serde_json::from_str::<Shape>(val).ok(),
            "layout" => layout = parse_layout(val),
            "initializer" => is_initializer = val.parse::<bool>().unwrap_or(false),
            "data" => data = serde_json::from_str::<Vec<u8>>(val).ok(),
            _ => {}
        }
    }
    let id = id.ok_or_else(|| parse_error(lineno, "value line missing id"))?;
    ensure_value_slot(graph, id);
    if let Some(v) = graph.value_mut(id) {
        v.name = name;
        v.dtype = dtype;
        v.shape = shape.clone();
        v.layout = layout;
        v.is_initializer = is_initializer;
        if is_initializer {
            if let (Some(shape), Some(bytes)) = (shape, data) {
                if let Ok(tensor) = Tensor::from_raw_bytes(dtype, shape, &bytes) {
                    v.tensor = Some(tensor);
                }
            }
        }
    }
    Ok(())
}

fn parse_node_line(graph: &mut Graph, fields: &[&str], lineno: usize) -> EngineResult<()> {
    let mut op_type = String::new();
    let mut name = String::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut attrs = AttributeBag::new();

    for field in fields {
        let (key, val) = parse_kv(field, lineno)?;
        match key {
            "id" => {
                let _ = parse_node_id(val)?;
            }
            "op" => op_type = val.to_string(),
            "name" => name = val.to_string(),
            "inputs" => inputs = parse_value_ids(val)?,
            "outputs" => outputs = parse_value_ids(val)?,
            "attrs" => attrs = serde_json::from_str(val).unwrap_or_default(),
            _ => {}
        }
    }

    for &id in inputs.iter().chain(outputs.iter()) {
        ensure_value_slot(graph, id);
    }

    graph.add_node(op_type, name, &inputs, &outputs, attrs)?;
    Ok(())
}
