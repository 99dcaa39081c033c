// Helper functions for extracting values from KDL nodes

use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Integers and floats are both accepted.
pub(crate) fn get_number_prop(node: &KdlNode, name: &str) -> Option<f64> {
    let value = node.get(name)?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

pub(crate) fn get_integer_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

pub(crate) fn get_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

/// Child nodes of the form `key "value"`, collected into a map.
pub(crate) fn get_string_map(children: Option<&KdlDocument>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(children) = children {
        for child in children.nodes() {
            if let Some(value) = get_first_string_arg(child) {
                map.insert(child.name().value().to_string(), value);
            }
        }
    }
    map
}

/// Values for `name`, either repeated as properties or given as a child
/// node with several arguments.
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
