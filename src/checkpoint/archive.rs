//! PyTorch zip archive access
//!
//! `torch.save` writes a zip file holding `<prefix>/data.pkl` plus one raw
//! little-endian file per storage under `<prefix>/data/`.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Open checkpoint archive with a cache of decoded storages
pub struct CheckpointArchive {
    path: PathBuf,
    zip: zip::ZipArchive<BufReader<File>>,
    /// Directory prefix of all entries, including the trailing slash
    prefix: String,
    storages: HashMap<String, Tensor>,
}

impl CheckpointArchive {
    /// Open a checkpoint and locate its pickle payload
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open checkpoint: {:?}", path))?;
        let zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
            anyhow!(
                "{:?} is not a zip-format PyTorch checkpoint ({}); legacy torch.save files are not supported",
                path,
                e
            )
        })?;

        let prefix = zip
            .file_names()
            .find_map(|name| name.strip_suffix("data.pkl"))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No data.pkl entry in checkpoint archive {:?}", path))?;

        tracing::debug!("Opened {:?} ({} entries, prefix {:?})", path, zip.len(), prefix);

        Ok(Self {
            path: path.to_path_buf(),
            zip,
            prefix,
            storages: HashMap::new(),
        })
    }

    /// Run the pickle payload and return the top-level object
    pub fn read_object(&mut self) -> Result<Object> {
        let name = format!("{}data.pkl", self.prefix);
        let entry = self
            .zip
            .by_name(&name)
            .with_context(|| format!("Missing {} in {:?}", name, self.path))?;
        let mut reader = BufReader::new(entry);
        unpickle(&mut reader).with_context(|| format!("Failed to unpickle {}", name))
    }

    /// Decode a whole storage as a flat 1-D tensor
    ///
    /// Storages are shared between views, so each one is decoded once.
    pub fn storage(&mut self, key: &str, dtype: DType) -> Result<Tensor> {
        if let Some(tensor) = self.storages.get(key) {
            return Ok(tensor.clone());
        }

        let name = format!("{}data/{}", self.prefix, key);
        let bytes = {
            let mut entry = self
                .zip
                .by_name(&name)
                .with_context(|| format!("Missing storage {} in {:?}", name, self.path))?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .with_context(|| format!("Failed to read storage {}", name))?;
            bytes
        };

        let tensor = decode_storage(&bytes, dtype)
            .with_context(|| format!("Failed to decode storage {} as {:?}", name, dtype))?;
        self.storages.insert(key.to_string(), tensor.clone());
        Ok(tensor)
    }
}

/// Opcodes that fill a dict from the pairs above the topmost mark
const SETITEMS: u8 = b'u';
const DICT: u8 = b'd';

/// Key of the pair pushed ahead of each batch of dict items, carrying its size
const BATCH_MARKER: &str = "\u{0}mlp_ckpt.setitems";

/// Run a pickle stream to completion, keeping dict entries in saved order
///
/// Candle's `SETITEMS` and `DICT` append each batch last pair first. Before every
/// batch of two or more pairs a marker pair holding the batch size is pushed;
/// it lands directly ahead of the reversed batch, which is flipped back once
/// the stream is done. Batches are handled one at a time because the pickler
/// splits large dicts into several.
pub(crate) fn unpickle<R: BufRead>(reader: &mut R) -> Result<Object> {
    let mut stack = Stack::empty();
    loop {
        let next = reader.fill_buf()?.first().copied();
        if matches!(next, Some(SETITEMS | DICT)) {
            if let Some(pairs) = pending_pairs(stack.stack()) {
                if pairs > 1 {
                    push_batch_marker(&mut stack, pairs)?;
                }
            }
        }
        if stack.read(reader)? {
            break;
        }
    }

    let mut obj = stack
        .finalize()
        .context("Pickle stream did not produce an object")?;
    restore_dict_order(&mut obj);
    Ok(obj)
}

/// Key/value pairs above the topmost mark
fn pending_pairs(stack: &[Object]) -> Option<usize> {
    let mark = stack.iter().rposition(|o| matches!(o, Object::Mark))?;
    Some((stack.len() - mark - 1) / 2)
}

fn push_batch_marker(stack: &mut Stack, pairs: usize) -> Result<()> {
    let pairs = i32::try_from(pairs).context("Dict batch too large")?;
    let mut ops = Vec::with_capacity(BATCH_MARKER.len() + 10);
    ops.push(b'X');
    ops.extend_from_slice(&(BATCH_MARKER.len() as u32).to_le_bytes());
    ops.extend_from_slice(BATCH_MARKER.as_bytes());
    ops.push(b'J');
    ops.extend_from_slice(&pairs.to_le_bytes());

    let mut ops = ops.as_slice();
    stack.read(&mut ops)?;
    stack.read(&mut ops)?;
    Ok(())
}

fn batch_size(entry: &(Object, Object)) -> Option<usize> {
    match entry {
        (Object::Unicode(key), Object::Int(n)) if key == BATCH_MARKER => usize::try_from(*n).ok(),
        _ => None,
    }
}

/// Drop batch markers and flip the batch following each one
fn restore_dict_order(obj: &mut Object) {
    match obj {
        Object::Dict(items) => {
            let mut i = 0;
            while i < items.len() {
                match batch_size(&items[i]) {
                    Some(n) => {
                        items.remove(i);
                        let end = (i + n).min(items.len());
                        items[i..end].reverse();
                        i = end;
                    }
                    None => i += 1,
                }
            }
            for (key, value) in items.iter_mut() {
                restore_dict_order(key);
                restore_dict_order(value);
            }
        }
        Object::Tuple(items) | Object::List(items) => {
            for item in items.iter_mut() {
                restore_dict_order(item);
            }
        }
        Object::Reduce { callable, args } | Object::Build { callable, args } => {
            restore_dict_order(callable);
            restore_dict_order(args);
        }
        Object::PersistentLoad(inner) => restore_dict_order(inner),
        _ => {}
    }
}

/// Decode little-endian storage bytes into a 1-D CPU tensor
fn decode_storage(bytes: &[u8], dtype: DType) -> Result<Tensor> {
    let elem_size = dtype.size_in_bytes();
    if bytes.len() % elem_size != 0 {
        bail!(
            "Storage size {} is not a multiple of the element size {}",
            bytes.len(),
            elem_size
        );
    }
    let len = bytes.len() / elem_size;
    let device = Device::Cpu;

    let tensor = match dtype {
        DType::F32 => {
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(values, len, &device)?
        }
        DType::F64 => {
            let values: Vec<f64> = bytes
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            Tensor::from_vec(values, len, &device)?
        }
        DType::I64 => {
            let values: Vec<i64> = bytes
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            Tensor::from_vec(values, len, &device)?
        }
        DType::U8 => Tensor::from_vec(bytes.to_vec(), len, &device)?,
        // Half types have no std decoder; candle reads them in native order
        _ => Tensor::from_raw_buffer(bytes, dtype, &[len], &device)?,
    };
    Ok(tensor)
}
