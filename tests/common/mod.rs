//! Checkpoint fixtures for integration tests
//!
//! Writes zip archives in the layout `torch.save` produces, with a protocol 2
//! pickle built opcode by opcode.

#![allow(dead_code)]

use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// How a module object is constructed in the pickle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEncoding {
    /// `cls.__new__(cls)` through `NEWOBJ`, what protocol 2 emits
    NewObj,
    /// `copyreg._reconstructor(cls, object, None)`, what protocols 0 and 1 emit
    Reconstructor,
}

/// Minimal protocol 2 pickle emitter
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl Default for PickleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PickleWriter {
    pub fn new() -> Self {
        Self {
            buf: vec![0x80, 0x02],
        }
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.buf.push(b'c');
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.buf.push(b'X');
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn int(&mut self, v: i32) -> &mut Self {
        self.buf.push(b'J');
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn float(&mut self, v: f64) -> &mut Self {
        self.buf.push(b'G');
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(if v { 0x88 } else { 0x89 });
        self
    }

    pub fn none(&mut self) -> &mut Self {
        self.buf.push(b'N');
        self
    }

    pub fn mark(&mut self) -> &mut Self {
        self.buf.push(b'(');
        self
    }

    pub fn tuple(&mut self) -> &mut Self {
        self.buf.push(b't');
        self
    }

    pub fn empty_tuple(&mut self) -> &mut Self {
        self.buf.push(b')');
        self
    }

    pub fn empty_dict(&mut self) -> &mut Self {
        self.buf.push(b'}');
        self
    }

    pub fn set_item(&mut self) -> &mut Self {
        self.buf.push(b's');
        self
    }

    pub fn set_items(&mut self) -> &mut Self {
        self.buf.push(b'u');
        self
    }

    pub fn reduce(&mut self) -> &mut Self {
        self.buf.push(b'R');
        self
    }

    pub fn newobj(&mut self) -> &mut Self {
        self.buf.push(0x81);
        self
    }

    pub fn build(&mut self) -> &mut Self {
        self.buf.push(b'b');
        self
    }

    pub fn persistent_id(&mut self) -> &mut Self {
        self.buf.push(b'Q');
        self
    }

    pub fn int_tuple(&mut self, values: &[usize]) -> &mut Self {
        if values.is_empty() {
            return self.empty_tuple();
        }
        self.mark();
        for &v in values {
            self.int(v as i32);
        }
        self.tuple()
    }

    /// `OrderedDict()` followed by a mark; close with `set_items`
    pub fn ordered_dict_open(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict")
            .empty_tuple()
            .reduce()
            .mark()
    }

    pub fn empty_ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict").empty_tuple().reduce()
    }

    /// `_rebuild_tensor_v2` of a contiguous float tensor stored under `key`
    pub fn tensor(&mut self, key: &str, shape: &[usize]) -> &mut Self {
        let numel: usize = shape.iter().product();
        self.global("torch._utils", "_rebuild_tensor_v2").mark();
        self.mark()
            .string("storage")
            .global("torch", "FloatStorage")
            .string(key)
            .string("cpu")
            .int(numel as i32)
            .tuple()
            .persistent_id();
        self.int(0)
            .int_tuple(shape)
            .int_tuple(&contiguous_stride(shape))
            .bool(false)
            .empty_ordered_dict()
            .tuple()
            .reduce()
    }

    /// `_rebuild_parameter` wrapping a tensor
    pub fn parameter(&mut self, key: &str, shape: &[usize]) -> &mut Self {
        self.global("torch._utils", "_rebuild_parameter").mark();
        self.tensor(key, shape)
            .bool(true)
            .empty_ordered_dict()
            .tuple()
            .reduce()
    }

    /// Object of class `module.class`, then an open state dict; close with
    /// `module_close`
    pub fn module_open(&mut self, module: &str, class: &str, encoding: ModuleEncoding) -> &mut Self {
        match encoding {
            ModuleEncoding::NewObj => {
                self.global(module, class).empty_tuple().newobj();
            }
            ModuleEncoding::Reconstructor => {
                self.global("copyreg", "_reconstructor")
                    .mark()
                    .global(module, class)
                    .global("builtins", "object")
                    .none()
                    .tuple()
                    .reduce();
            }
        }
        self.empty_dict().mark()
    }

    pub fn module_close(&mut self) -> &mut Self {
        self.set_items().build()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        out.push(b'.');
        out
    }
}

fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1] * shape[i + 1];
    }
    stride
}

/// One named float tensor
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Param {
    pub fn new(name: &str, shape: &[usize], seed: u32) -> Self {
        let numel = shape.iter().product();
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            data: values(numel, seed),
        }
    }
}

/// Deterministic values that do not have short decimal forms
pub fn values(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

/// Parameters of the head `input -> hidden[0] -> hidden[1] -> classes`
pub fn mlp_params(input: usize, hidden: [usize; 2], classes: usize) -> Vec<Param> {
    let dims = [(0, input, hidden[0]), (3, hidden[0], hidden[1]), (6, hidden[1], classes)];
    let mut params = Vec::new();
    for (seed, &(index, in_dim, out_dim)) in dims.iter().enumerate() {
        let seed = seed as u32 * 2;
        params.push(Param::new(&format!("mlp.{}.weight", index), &[out_dim, in_dim], seed));
        params.push(Param::new(&format!("mlp.{}.bias", index), &[out_dim], seed + 1));
    }
    params
}

/// Write a zip archive with `archive/data.pkl` and one storage per param
pub fn write_archive(path: &Path, pickle: &[u8], params: &[Param]) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("archive/data.pkl", options)?;
    zip.write_all(pickle)?;
    for (i, param) in params.iter().enumerate() {
        zip.start_file(format!("archive/data/{}", i), options)?;
        for v in &param.data {
            zip.write_all(&v.to_le_bytes())?;
        }
    }
    zip.start_file("archive/version", options)?;
    zip.write_all(b"3\n")?;
    zip.finish()?;
    Ok(())
}

/// `OrderedDict` of tensors followed by the `_metadata` attribute that
/// `state_dict()` attaches
fn write_state_dict_items(w: &mut PickleWriter, params: &[Param]) {
    w.ordered_dict_open();
    for (i, param) in params.iter().enumerate() {
        w.string(&param.name).tensor(&i.to_string(), &param.shape);
    }
    w.set_items();

    let mut prefixes: Vec<String> = vec![String::new()];
    for param in params {
        if let Some((prefix, _)) = param.name.rsplit_once('.') {
            if !prefixes.iter().any(|p| p == prefix) {
                prefixes.push(prefix.to_string());
            }
        }
    }
    w.empty_dict().string("_metadata").ordered_dict_open();
    for prefix in &prefixes {
        w.string(prefix).empty_dict().string("version").int(1).set_item();
    }
    w.set_items().set_item().build();
}

/// `torch.save(model.state_dict(), path)`
pub fn write_state_dict(path: &Path, params: &[Param]) -> Result<()> {
    let mut w = PickleWriter::new();
    write_state_dict_items(&mut w, params);
    write_archive(path, &w.finish(), params)
}

/// `torch.save({"epoch": 3, key: model.state_dict()}, path)`
pub fn write_nested_state_dict(path: &Path, key: &str, params: &[Param]) -> Result<()> {
    let mut w = PickleWriter::new();
    w.empty_dict().mark().string("epoch").int(3).string(key);
    write_state_dict_items(&mut w, params);
    w.set_items();
    write_archive(path, &w.finish(), params)
}

/// `torch.save({"epoch": 3, **tensors}, path)`: a plain dict mixing tensors
/// with other values
pub fn write_plain_dict(path: &Path, params: &[Param]) -> Result<()> {
    let mut w = PickleWriter::new();
    w.empty_dict().mark();
    for (i, param) in params.iter().enumerate() {
        w.string(&param.name).tensor(&i.to_string(), &param.shape);
    }
    w.string("epoch").int(3).set_items();
    write_archive(path, &w.finish(), params)
}

/// A pickle holding a plain tuple of ints
pub fn write_tuple(path: &Path, items: &[usize]) -> Result<()> {
    let mut w = PickleWriter::new();
    w.int_tuple(items);
    write_archive(path, &w.finish(), &[])
}

fn write_leaf(
    w: &mut PickleWriter,
    encoding: ModuleEncoding,
    class: &str,
    attrs: impl FnOnce(&mut PickleWriter),
) {
    w.module_open(&format!("torch.nn.modules.{}", leaf_module(class)), class, encoding);
    w.string("training").bool(false);
    w.string("_parameters").ordered_dict_open().set_items();
    w.string("_modules").ordered_dict_open().set_items();
    attrs(w);
    w.module_close();
}

fn leaf_module(class: &str) -> &'static str {
    match class {
        "Linear" => "linear",
        "Dropout" => "dropout",
        _ => "activation",
    }
}

/// `torch.save(model, path)` for an `MLPHead` defined in `__main__`
///
/// `params` must come from `mlp_params`.
pub fn write_mlp_model(path: &Path, params: &[Param], dropout: f64) -> Result<()> {
    write_mlp_model_as(path, params, dropout, ModuleEncoding::NewObj)
}

/// `write_mlp_model` with a chosen module encoding
pub fn write_mlp_model_as(
    path: &Path,
    params: &[Param],
    dropout: f64,
    encoding: ModuleEncoding,
) -> Result<()> {
    let mut w = PickleWriter::new();
    w.module_open("__main__", "MLPHead", encoding);
    w.string("training").bool(false);
    w.string("_parameters").ordered_dict_open().set_items();
    w.string("_modules").ordered_dict_open();
    w.string("mlp");

    w.module_open("torch.nn.modules.container", "Sequential", encoding);
    w.string("training").bool(false);
    w.string("_parameters").ordered_dict_open().set_items();
    w.string("_modules").ordered_dict_open();
    for slot in 0..8 {
        w.string(&slot.to_string());
        match slot {
            0 | 3 | 6 => write_linear(&mut w, encoding, params, slot),
            1 | 4 => write_leaf(&mut w, encoding, "ReLU", |w| {
                w.string("inplace").bool(false);
            }),
            2 | 5 => write_leaf(&mut w, encoding, "Dropout", |w| {
                w.string("p").float(dropout).string("inplace").bool(false);
            }),
            _ => write_leaf(&mut w, encoding, "Sigmoid", |_| {}),
        }
    }
    w.set_items();
    w.module_close();

    w.set_items();
    w.module_close();
    write_archive(path, &w.finish(), params)
}

fn write_linear(w: &mut PickleWriter, encoding: ModuleEncoding, params: &[Param], slot: usize) {
    let find = |kind: &str| {
        let name = format!("mlp.{}.{}", slot, kind);
        params
            .iter()
            .position(|p| p.name == name)
            .map(|i| (i, &params[i]))
            .unwrap_or_else(|| panic!("missing fixture parameter {}", name))
    };
    let (wi, weight) = find("weight");
    let (bi, bias) = find("bias");

    w.module_open("torch.nn.modules.linear", "Linear", encoding);
    w.string("training").bool(false);
    w.string("_parameters").ordered_dict_open();
    w.string("weight").parameter(&wi.to_string(), &weight.shape);
    w.string("bias").parameter(&bi.to_string(), &bias.shape);
    w.set_items();
    w.string("_modules").ordered_dict_open().set_items();
    w.string("in_features").int(weight.shape[1] as i32);
    w.string("out_features").int(weight.shape[0] as i32);
    w.module_close();
}
