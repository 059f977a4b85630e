//! Exported weights file
//!
//! Flat JSON object mapping each parameter's dotted name to its values and
//! shape:
//!
//! ```json
//! {
//!   "mlp.0.weight": { "data": [[0.1, ...], ...], "shape": [256, 512] },
//!   "mlp.0.bias": { "data": [0.0, ...], "shape": [256] }
//! }
//! ```
//!
//! Entries keep parameter iteration order. Floats are widened to f64 without
//! any other transformation, so reading a value back and narrowing it to the
//! original dtype is exact.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::models::Model;

/// Nested array of numbers, one nesting level per dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedData {
    /// Element of an integer tensor
    Int(i64),
    /// Element of a floating point tensor
    Float(f64),
    /// One dimension
    List(Vec<NestedData>),
}

/// One exported parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedTensor {
    /// Values nested one level per dimension
    pub data: NestedData,
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
}

impl ExportedTensor {
    /// Copy a tensor into host memory as nested lists
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?;
        let data = if tensor.dtype().is_int() {
            let values = flat.to_dtype(DType::I64)?.to_vec1::<i64>()?;
            nest(&values, &shape, &NestedData::Int)
        } else {
            let values = flat.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                bail!(
                    "Value {} at flat index {} cannot be written as JSON (NaN and infinity have no JSON form)",
                    values[pos],
                    pos
                );
            }
            nest(&values, &shape, &NestedData::Float)
        };
        Ok(Self { data, shape })
    }

    /// Number of elements `shape` describes
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Flatten `data` in row-major order, checking it against `shape`
    pub fn flatten_f64(&self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.elem_count());
        flatten_into(&self.data, &self.shape, &mut out)
            .with_context(|| format!("Data does not match shape {:?}", self.shape))?;
        Ok(out)
    }

    /// Rebuild the tensor with the given dtype
    ///
    /// Values pass through f64, so integers beyond 2^53 are not exact.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let values = self.flatten_f64()?;
        let tensor = Tensor::from_vec(values, self.shape.clone(), device)?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

fn nest<T: Copy>(flat: &[T], shape: &[usize], leaf: &impl Fn(T) -> NestedData) -> NestedData {
    match shape.split_first() {
        None => leaf(flat[0]),
        Some((&dim, rest)) => {
            let chunk: usize = rest.iter().product();
            NestedData::List(
                (0..dim)
                    .map(|i| nest(&flat[i * chunk..(i + 1) * chunk], rest, leaf))
                    .collect(),
            )
        }
    }
}

fn flatten_into(data: &NestedData, shape: &[usize], out: &mut Vec<f64>) -> Result<()> {
    match (data, shape.split_first()) {
        (NestedData::Float(v), None) => out.push(*v),
        (NestedData::Int(v), None) => out.push(*v as f64),
        (NestedData::List(items), Some((&dim, rest))) => {
            if items.len() != dim {
                bail!("Expected {} entries, found {}", dim, items.len());
            }
            for item in items {
                flatten_into(item, rest, out)?;
            }
        }
        (NestedData::List(_), None) => bail!("Found a list where a number was expected"),
        (_, Some(_)) => bail!("Found a number where a list was expected"),
    }
    Ok(())
}

/// Ordered mapping from parameter name to exported tensor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightsFile {
    entries: Vec<(String, ExportedTensor)>,
}

impl WeightsFile {
    /// Build from entries in order
    pub fn new(entries: Vec<(String, ExportedTensor)>) -> Self {
        Self { entries }
    }

    /// Export every parameter whose name contains `weight` or `bias`
    ///
    /// Prints one line per exported parameter to `out`.
    pub fn from_model<W: Write>(model: &dyn Model, out: &mut W) -> Result<Self> {
        let mut entries = Vec::new();
        for (name, param) in model.named_parameters() {
            if !is_exported_name(&name) {
                tracing::debug!("Skipping parameter {}", name);
                continue;
            }
            let exported = ExportedTensor::from_tensor(&param)
                .with_context(|| format!("Failed to export {}", name))?;
            writeln!(out, "  Exported {}: shape {:?}", name, exported.shape)?;
            entries.push((name, exported));
        }
        Ok(Self { entries })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry by parameter name
    pub fn get(&self, name: &str) -> Option<&ExportedTensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportedTensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// `(layer name, in_features, out_features)` for every 2-D weight
    pub fn linear_layers(&self) -> Vec<(String, usize, usize)> {
        self.iter()
            .filter_map(|(name, t)| {
                let layer = name.strip_suffix(".weight")?;
                match t.shape.as_slice() {
                    &[out_features, in_features] => {
                        Some((layer.to_string(), in_features, out_features))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Write as JSON indented with two spaces
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create weights file: {:?}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write weights file: {:?}", path))?;
        writer.flush()?;
        Ok(())
    }

    /// Read a weights file written by `save`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open weights file: {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse weights file: {:?}", path))
    }
}

/// Parameters the exporter keeps
pub fn is_exported_name(name: &str) -> bool {
    name.contains("weight") || name.contains("bias")
}

impl Serialize for WeightsFile {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, tensor) in &self.entries {
            map.serialize_entry(name, tensor)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WeightsFile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = WeightsFile;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of parameter names to {data, shape}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, tensor)) = access.next_entry::<String, ExportedTensor>()? {
                    entries.push((name, tensor));
                }
                Ok(WeightsFile { entries })
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
