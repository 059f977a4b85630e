//! Checkpoint loading and classification
//!
//! A checkpoint is read once and sorted into one of three shapes:
//! - a full pickled model (`torch.save(model, ...)`)
//! - a state dict (`torch.save(model.state_dict(), ...)`)
//! - anything else, kept only as a type name and text preview

mod archive;
mod module;
mod tensor;

pub use archive::CheckpointArchive;
pub use module::{AttrValue, ModuleNode};
pub use tensor::{storage_dtype, TensorRef};

use anyhow::{anyhow, Context, Result};
use candle_core::pickle::Object;
use candle_core::Tensor;
use std::collections::HashMap;
use std::path::Path;

use crate::utils::repr_utils::{python_bool, python_float, truncate_chars};

/// Maximum length of the text preview kept for unrecognised objects
const PREVIEW_CHARS: usize = 200;

/// Attribute `state_dict()` attaches to its `OrderedDict`; the unpickler
/// merges it into the entries
const METADATA_KEY: &str = "_metadata";

/// Ordered parameter-name-to-tensor mapping
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
    /// Keys whose values are not tensors, in saved order
    skipped: Vec<String>,
    /// Saved as `collections.OrderedDict` rather than a plain dict
    ordered: bool,
}

impl StateDict {
    /// Build from entries in their saved order, as `state_dict()` returns them
    pub fn new(entries: Vec<(String, Tensor)>) -> Self {
        Self {
            entries,
            skipped: Vec::new(),
            ordered: true,
        }
    }

    /// Python type name of the saved mapping
    pub fn type_name(&self) -> &'static str {
        if self.ordered {
            "collections.OrderedDict"
        } else {
            "dict"
        }
    }

    /// Keys of entries that are not tensors
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Number of keys, tensors or not, as `len()` counts them in Python
    pub fn total_keys(&self) -> usize {
        self.entries.len() + self.skipped.len()
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tensor by exact key
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    /// Keys in saved order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in saved order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Copy into a map, the form `VarBuilder::from_tensors` expects
    pub fn to_map(&self) -> HashMap<String, Tensor> {
        self.entries.iter().cloned().collect()
    }
}

/// A loaded checkpoint
#[derive(Debug, Clone)]
pub enum Checkpoint {
    /// Full pickled `nn.Module`
    Model(ModuleNode),
    /// Bare parameter mapping
    StateDict(StateDict),
    /// Something else entirely
    Other {
        /// Python type name of the top-level object
        type_name: String,
        /// Textual rendering, truncated
        preview: String,
    },
}

impl Checkpoint {
    /// Load and classify a checkpoint
    ///
    /// # Arguments
    /// * `path` - Path to a zip-format `.pt` / `.pth` file
    /// * `key` - Optional entry of a top-level dict to descend into, for
    ///   checkpoints like `{"model_state_dict": ..., "epoch": 3}`
    pub fn load<P: AsRef<Path>>(path: P, key: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = CheckpointArchive::open(path)?;
        let obj = archive.read_object()?;
        let obj = match key {
            Some(key) => select_key(obj, key)?,
            None => obj,
        };
        Self::from_object(&obj, &mut archive)
            .with_context(|| format!("Failed to decode checkpoint {:?}", path))
    }

    /// Classify an unpickled object, reading tensors from `archive`
    pub fn from_object(obj: &Object, archive: &mut CheckpointArchive) -> Result<Self> {
        if let Some(module) = ModuleNode::from_object(obj, archive)? {
            return Ok(Checkpoint::Model(module));
        }

        if let Some(items) = as_dict(obj) {
            let mut state = StateDict {
                entries: Vec::with_capacity(items.len()),
                skipped: Vec::new(),
                ordered: false,
            };
            for (key, value) in items {
                let Object::Unicode(key) = key else {
                    state.skipped.push(describe(key));
                    continue;
                };
                if key == METADATA_KEY {
                    state.ordered = true;
                    continue;
                }
                match TensorRef::from_object(value)? {
                    Some(tensor_ref) => {
                        let tensor = tensor_ref
                            .materialize(archive)
                            .with_context(|| format!("Failed to read tensor {}", key))?;
                        state.entries.push((key.clone(), tensor));
                    }
                    None => state.skipped.push(key.clone()),
                }
            }

            if !state.skipped.is_empty() {
                tracing::debug!("Skipped non-tensor entries: {:?}", state.skipped);
                if state.entries.is_empty() {
                    tracing::warn!(
                        "Dict holds no tensors at the top level; pass --key to select a nested state dict"
                    );
                    return Ok(Checkpoint::Other {
                        type_name: state.type_name().to_string(),
                        preview: truncate_chars(&describe(obj), PREVIEW_CHARS).to_string(),
                    });
                }
            }
            return Ok(Checkpoint::StateDict(state));
        }

        Ok(Checkpoint::Other {
            type_name: type_name(obj),
            preview: truncate_chars(&describe(obj), PREVIEW_CHARS).to_string(),
        })
    }

    /// Python-style type of the top-level object
    pub fn type_name(&self) -> String {
        match self {
            Checkpoint::Model(module) => module.qualified_name(),
            Checkpoint::StateDict(state) => state.type_name().to_string(),
            Checkpoint::Other { type_name, .. } => type_name.clone(),
        }
    }
}

/// Descend into `key` of a top-level dict
fn select_key(obj: Object, key: &str) -> Result<Object> {
    let type_name = type_name(&obj);
    let items = match obj {
        Object::Dict(items) => items,
        Object::Build { callable, .. } => match *callable {
            Object::Dict(items) => items,
            _ => return Err(anyhow!("Cannot select key {:?}: checkpoint holds a {}", key, type_name)),
        },
        _ => return Err(anyhow!("Cannot select key {:?}: checkpoint holds a {}", key, type_name)),
    };
    items
        .into_iter()
        .find_map(|(k, v)| match k {
            Object::Unicode(k) if k == key => Some(v),
            _ => None,
        })
        .ok_or_else(|| anyhow!("Key {:?} not found in checkpoint", key))
}

/// Entries of a dict, including an `OrderedDict` whose attribute state was
/// kept separately by the unpickler
pub(crate) fn as_dict(obj: &Object) -> Option<&[(Object, Object)]> {
    match obj {
        Object::Dict(items) => Some(items.as_slice()),
        Object::Build { callable, .. } => match callable.as_ref() {
            Object::Dict(items) => Some(items.as_slice()),
            _ => None,
        },
        _ => None,
    }
}

/// `(module, class)` of the object a `BUILD` opcode is applied to
///
/// Protocol 2 pickles construct objects with `NEWOBJ` (the class is called
/// directly); older protocols go through `copyreg._reconstructor(cls, base, state)`.
pub(crate) fn class_of(obj: &Object) -> Option<(String, String)> {
    let Object::Reduce { callable, args } = obj else {
        return None;
    };
    let Object::Class {
        module_name,
        class_name,
    } = callable.as_ref()
    else {
        return None;
    };
    if module_name == "copyreg" && class_name == "_reconstructor" {
        match args.as_ref() {
            Object::Tuple(items) => match items.first() {
                Some(Object::Class {
                    module_name,
                    class_name,
                }) => Some((module_name.clone(), class_name.clone())),
                _ => None,
            },
            _ => None,
        }
    } else {
        Some((module_name.clone(), class_name.clone()))
    }
}

/// Python type name of an unpickled object
pub(crate) fn type_name(obj: &Object) -> String {
    match obj {
        Object::Int(_) => "int".to_string(),
        Object::Float(_) => "float".to_string(),
        Object::Unicode(_) => "str".to_string(),
        Object::Bool(_) => "bool".to_string(),
        Object::None => "NoneType".to_string(),
        Object::Tuple(_) => "tuple".to_string(),
        Object::List(_) => "list".to_string(),
        Object::Dict(_) => "dict".to_string(),
        _ if tensor::is_tensor(obj) => "torch.Tensor".to_string(),
        Object::Build { callable, .. } => type_name(callable),
        Object::Reduce { .. } => match class_of(obj) {
            Some((module_name, class_name)) => format!("{}.{}", module_name, class_name),
            None => "object".to_string(),
        },
        Object::Class {
            module_name,
            class_name,
        } => format!("type[{}.{}]", module_name, class_name),
        _ => "object".to_string(),
    }
}

/// Short Python-like rendering of an unpickled object
pub(crate) fn describe(obj: &Object) -> String {
    let join = |items: &[Object]| {
        items
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match obj {
        Object::Int(v) => v.to_string(),
        Object::Float(v) => python_float(*v),
        Object::Unicode(v) => format!("'{}'", v),
        Object::Bool(v) => python_bool(*v).to_string(),
        Object::None => "None".to_string(),
        Object::Tuple(items) if items.len() == 1 => format!("({},)", describe(&items[0])),
        Object::Tuple(items) => format!("({})", join(items)),
        Object::List(items) => format!("[{}]", join(items)),
        Object::Dict(items) => {
            let body = items
                .iter()
                .map(|(k, v)| format!("{}: {}", describe(k), describe(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{}}}", body)
        }
        Object::Class {
            module_name,
            class_name,
        } => format!("<class '{}.{}'>", module_name, class_name),
        _ if tensor::is_tensor(obj) => match TensorRef::from_object(obj) {
            Ok(Some(t)) => format!("tensor(shape={:?}, dtype={:?})", t.shape, t.dtype),
            _ => "tensor(...)".to_string(),
        },
        Object::PersistentLoad(_) => "<storage>".to_string(),
        _ => format!("<{} object>", type_name(obj)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(module_name: &str, class_name: &str) -> Object {
        Object::Class {
            module_name: module_name.to_string(),
            class_name: class_name.to_string(),
        }
    }

    #[test]
    fn test_class_of_newobj_and_reconstructor() {
        let newobj = Object::Reduce {
            callable: Box::new(class("__main__", "MLPHead")),
            args: Box::new(Object::Tuple(vec![])),
        };
        assert_eq!(
            class_of(&newobj),
            Some(("__main__".to_string(), "MLPHead".to_string()))
        );

        let reconstructed = Object::Reduce {
            callable: Box::new(class("copyreg", "_reconstructor")),
            args: Box::new(Object::Tuple(vec![
                class("torch.nn.modules.linear", "Linear"),
                class("builtins", "object"),
                Object::None,
            ])),
        };
        assert_eq!(
            class_of(&reconstructed),
            Some(("torch.nn.modules.linear".to_string(), "Linear".to_string()))
        );
    }

    #[test]
    fn test_type_name_and_describe() {
        let list = Object::List(vec![Object::Int(1), Object::Unicode("a".to_string())]);
        assert_eq!(type_name(&list), "list");
        assert_eq!(describe(&list), "[1, 'a']");
        assert_eq!(describe(&Object::Tuple(vec![Object::Bool(true)])), "(True,)");
    }

    #[test]
    fn test_select_key() {
        let checkpoint = || {
            Object::Dict(vec![
                (Object::Unicode("epoch".to_string()), Object::Int(3)),
                (Object::Unicode("model".to_string()), Object::Dict(vec![])),
            ])
        };
        let selected = select_key(checkpoint(), "model").unwrap();
        assert!(matches!(selected, Object::Dict(ref items) if items.is_empty()));
        assert!(select_key(checkpoint(), "optimizer").is_err());
        assert!(select_key(Object::Int(1), "model").is_err());
    }

    #[test]
    fn test_state_dict_lookup() {
        let device = candle_core::Device::Cpu;
        let t = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        let state = StateDict::new(vec![("mlp.0.weight".to_string(), t)]);
        assert_eq!(state.len(), 1);
        assert!(state.get("mlp.0.weight").is_some());
        assert!(state.get("mlp.0").is_none());
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["mlp.0.weight"]);
        assert_eq!(state.total_keys(), 1);
        assert_eq!(state.type_name(), "collections.OrderedDict");
    }
}
