//! Pickled `nn.Module` trees
//!
//! A module saved with `torch.save(model, ...)` unpickles as an object whose
//! state dict carries `_parameters`, `_buffers` and `_modules` ordered dicts
//! plus plain attributes such as `in_features` or `p`.

use anyhow::{bail, Context, Result};
use candle_core::pickle::Object;
use candle_core::Tensor;
use candle_nn::Module;
use std::fmt;

use super::archive::CheckpointArchive;
use super::tensor::TensorRef;
use super::{as_dict, class_of};
use crate::models::Model;
use crate::utils::repr_utils::{python_bool, python_float};

/// Scalar attribute of a module (`in_features=512`, `p=0.3`, ...)
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", python_float(*v)),
            AttrValue::Bool(v) => write!(f, "{}", python_bool(*v)),
            AttrValue::Str(v) => write!(f, "'{}'", v),
            AttrValue::None => write!(f, "None"),
        }
    }
}

/// One module of a pickled model
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Python module the class was defined in (`__main__`, `torch.nn.modules.linear`)
    pub module_name: String,
    /// Bare class name (`Linear`)
    pub class_name: String,
    /// Direct parameters in registration order
    pub parameters: Vec<(String, Tensor)>,
    /// Child modules in registration order
    pub children: Vec<(String, ModuleNode)>,
    /// Public scalar attributes
    pub attributes: Vec<(String, AttrValue)>,
}

impl ModuleNode {
    /// Decode a pickled module, `Ok(None)` if `obj` is not an `nn.Module`
    pub fn from_object(obj: &Object, archive: &mut CheckpointArchive) -> Result<Option<Self>> {
        let Object::Build { callable, args } = obj else {
            return Ok(None);
        };
        let Some((module_name, class_name)) = class_of(callable) else {
            return Ok(None);
        };
        let Some(state) = as_dict(args) else {
            return Ok(None);
        };

        let has_key = |name: &str| {
            state
                .iter()
                .any(|(k, _)| matches!(k, Object::Unicode(k) if k == name))
        };
        if !has_key("_parameters") || !has_key("_modules") {
            return Ok(None);
        }

        let mut node = ModuleNode {
            module_name,
            class_name,
            parameters: Vec::new(),
            children: Vec::new(),
            attributes: Vec::new(),
        };

        for (key, value) in state {
            let Object::Unicode(key) = key else {
                continue;
            };
            match key.as_str() {
                // forward always runs in eval mode
                "training" => {}
                "_parameters" => {
                    for (name, param) in string_entries(value) {
                        if matches!(param, Object::None) {
                            continue;
                        }
                        let tensor_ref = TensorRef::from_object(param)?.with_context(|| {
                            format!("Parameter {} of {} is not a tensor", name, node.class_name)
                        })?;
                        let tensor = tensor_ref
                            .materialize(archive)
                            .with_context(|| format!("Failed to read parameter {}", name))?;
                        node.parameters.push((name.to_string(), tensor));
                    }
                }
                "_modules" => {
                    for (name, child) in string_entries(value) {
                        if matches!(child, Object::None) {
                            continue;
                        }
                        let child = ModuleNode::from_object(child, archive)
                            .with_context(|| format!("Failed to read submodule {}", name))?
                            .with_context(|| format!("Submodule {} is not an nn.Module", name))?;
                        node.children.push((name.to_string(), child));
                    }
                }
                _ if key.starts_with('_') => {}
                _ => {
                    if let Some(attr) = attr_value(value) {
                        node.attributes.push((key.clone(), attr));
                    }
                }
            }
        }

        tracing::debug!(
            "Decoded module {}.{} ({} parameters, {} children)",
            node.module_name,
            node.class_name,
            node.parameters.len(),
            node.children.len()
        );
        Ok(Some(node))
    }

    /// Fully qualified Python class name
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_name, self.class_name)
    }

    /// Direct parameter by name
    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Scalar attribute by name
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Parameters of this module and all descendants, with dotted names
    ///
    /// Order matches `nn.Module.named_parameters()`: own parameters first,
    /// then each child depth-first.
    pub fn collect_parameters(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (name, tensor) in &self.parameters {
            out.push((join_name(prefix, name), tensor.clone()));
        }
        for (name, child) in &self.children {
            child.collect_parameters(&join_name(prefix, name), out);
        }
    }

    /// The `extra_repr` text PyTorch shows inside the parentheses
    fn extra_repr(&self) -> String {
        let attr = |name: &str| {
            self.attribute(name)
                .map(ToString::to_string)
                .unwrap_or_else(|| "?".to_string())
        };
        match self.class_name.as_str() {
            "Linear" => format!(
                "in_features={}, out_features={}, bias={}",
                attr("in_features"),
                attr("out_features"),
                python_bool(self.parameter("bias").is_some())
            ),
            "Dropout" => format!("p={}, inplace={}", attr("p"), attr("inplace")),
            "ReLU" => match self.attribute("inplace") {
                Some(AttrValue::Bool(true)) => "inplace=True".to_string(),
                _ => String::new(),
            },
            _ => String::new(),
        }
    }

    fn write_repr(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let extra = self.extra_repr();
        if self.children.is_empty() {
            return write!(f, "{}({})", self.class_name, extra);
        }

        let pad = " ".repeat(indent + 2);
        writeln!(f, "{}(", self.class_name)?;
        if !extra.is_empty() {
            writeln!(f, "{}{}", pad, extra)?;
        }
        for (name, child) in &self.children {
            write!(f, "{}({}): ", pad, name)?;
            child.write_repr(f, indent + 2)?;
            writeln!(f)?;
        }
        write!(f, "{})", " ".repeat(indent))
    }
}

/// Structural summary in the layout of PyTorch's module `repr`
impl fmt::Display for ModuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_repr(f, 0)
    }
}

impl Model for ModuleNode {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::new();
        self.collect_parameters("", &mut params);
        params
    }

    /// Evaluation-mode forward pass for the layer types the classifier uses
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match self.class_name.as_str() {
            "Sequential" => {
                let mut y = x.clone();
                for (_, child) in &self.children {
                    y = child.forward(&y)?;
                }
                y
            }
            "Linear" => {
                let weight = self
                    .parameter("weight")
                    .context("Linear module has no weight")?
                    .clone();
                let bias = self.parameter("bias").cloned();
                candle_nn::Linear::new(weight, bias).forward(x)?
            }
            "ReLU" => x.relu()?,
            "Dropout" => x.clone(),
            "Sigmoid" => candle_nn::ops::sigmoid(x)?,
            _ if self.children.len() == 1 => self.children[0].1.forward(x)?,
            other => bail!("Forward pass not supported for module class {}", other),
        };
        Ok(y)
    }
}

fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// String-keyed entries of a dict object; other keys are skipped
fn string_entries(obj: &Object) -> impl Iterator<Item = (&str, &Object)> {
    as_dict(obj).unwrap_or(&[]).iter().filter_map(|(k, v)| match k {
        Object::Unicode(k) => Some((k.as_str(), v)),
        _ => None,
    })
}

fn attr_value(obj: &Object) -> Option<AttrValue> {
    let value = match obj {
        Object::Int(v) => AttrValue::Int(i64::from(*v)),
        Object::Float(v) => AttrValue::Float(*v),
        Object::Bool(v) => AttrValue::Bool(*v),
        Object::Unicode(v) => AttrValue::Str(v.clone()),
        Object::None => AttrValue::None,
        _ => return None,
    };
    Some(value)
}
