use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A tagged union over the ONNX attribute value kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

/// String-keyed attribute bag attached to a [`crate::graph::Node`] and
/// copied into an [`crate::operators::Operator`] instance before
/// `execute`.
///
/// Accessors are typed and return `Option`; a missing key or a
/// wrong-kind value falls back to the caller-supplied default rather
/// than panicking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeBag(pub HashMap<String, AttributeValue>);

impl AttributeBag {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        match self.0.get(name) {
            Some(AttributeValue::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn get_float(&self, name: &str, default: f32) -> f32 {
        match self.0.get(name) {
            Some(AttributeValue::Float(v)) => *v,
            _ => default,
        }
    }

    pub fn get_string<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.0.get(name) {
            Some(AttributeValue::String(v)) => v.as_str(),
            _ => default,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.0.get(name) {
            Some(AttributeValue::Ints(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_floats(&self, name: &str) -> Option<&[f32]> {
        match self.0.get(name) {
            Some(AttributeValue::Floats(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_strings(&self, name: &str) -> Option<&[String]> {
        match self.0.get(name) {
            Some(AttributeValue::Strings(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}
