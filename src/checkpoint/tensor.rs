//! Tensor references inside the pickle payload
//!
//! A saved tensor unpickles as
//! `torch._utils._rebuild_tensor_v2(storage, offset, size, stride, ...)`
//! where `storage` is a persistent id
//! `("storage", <class torch.FloatStorage>, key, location, numel)`.
//! Parameters wrap the same call in `torch._utils._rebuild_parameter`.

use anyhow::{bail, Context, Result};
use candle_core::pickle::Object;
use candle_core::{DType, Tensor};

use super::archive::CheckpointArchive;
use crate::utils::tensor_utils::{is_column_major, is_row_major};

/// Location and layout of one tensor within the archive
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    /// Storage file name under `data/`
    pub storage_key: String,
    /// Element type implied by the storage class
    pub dtype: DType,
    /// Element offset into the storage
    pub offset: usize,
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
    /// Element strides per dimension
    pub stride: Vec<usize>,
}

impl TensorRef {
    /// Decode a tensor reference, `Ok(None)` if `obj` is not a tensor
    pub fn from_object(obj: &Object) -> Result<Option<Self>> {
        let Some(args) = rebuild_args(obj) else {
            return Ok(None);
        };
        if args.len() < 4 {
            bail!(
                "Malformed tensor: expected at least 4 rebuild arguments, got {}",
                args.len()
            );
        }

        let (storage_key, dtype) = storage_info(&args[0])?;
        let offset = int_value(&args[1]).context("Invalid tensor storage offset")?;
        let shape = int_tuple(&args[2]).context("Invalid tensor size")?;
        let stride = int_tuple(&args[3]).context("Invalid tensor stride")?;

        Ok(Some(Self {
            storage_key,
            dtype,
            offset,
            shape,
            stride,
        }))
    }

    /// Number of elements
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Read the tensor data out of the archive
    pub fn materialize(&self, archive: &mut CheckpointArchive) -> Result<Tensor> {
        let storage = archive.storage(&self.storage_key, self.dtype)?;
        let elem_count = self.elem_count();
        let available = storage.elem_count();
        if self.offset + elem_count > available {
            bail!(
                "Tensor of shape {:?} at offset {} overruns storage {} ({} elements)",
                self.shape,
                self.offset,
                self.storage_key,
                available
            );
        }

        let flat = storage.narrow(0, self.offset, elem_count)?;
        if is_row_major(&self.shape, &self.stride) {
            Ok(flat.reshape(self.shape.clone())?)
        } else if is_column_major(&self.shape, &self.stride) {
            let reversed: Vec<usize> = self.shape.iter().rev().copied().collect();
            let dims: Vec<usize> = (0..self.shape.len()).rev().collect();
            Ok(flat.reshape(reversed)?.permute(dims)?.contiguous()?)
        } else {
            bail!(
                "Unsupported tensor layout: shape {:?} with stride {:?}",
                self.shape,
                self.stride
            )
        }
    }
}

/// Arguments of the innermost `_rebuild_tensor_v2` call
fn rebuild_args(obj: &Object) -> Option<&[Object]> {
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
    let Object::Tuple(args) = args.as_ref() else {
        return None;
    };

    match (module_name.as_str(), class_name.as_str()) {
        ("torch._utils", "_rebuild_tensor_v2") => Some(args.as_slice()),
        ("torch._utils", "_rebuild_parameter")
        | ("torch._utils", "_rebuild_parameter_with_state") => {
            args.first().and_then(rebuild_args)
        }
        _ => None,
    }
}

/// True if `obj` unpickles to a tensor or parameter
pub fn is_tensor(obj: &Object) -> bool {
    rebuild_args(obj).is_some()
}

fn storage_info(obj: &Object) -> Result<(String, DType)> {
    let Object::PersistentLoad(pid) = obj else {
        bail!("Tensor storage is not a persistent reference");
    };
    let Object::Tuple(fields) = pid.as_ref() else {
        bail!("Tensor persistent id is not a tuple");
    };
    match fields.as_slice() {
        [Object::Unicode(tag), Object::Class { class_name, .. }, Object::Unicode(key), ..]
            if tag == "storage" =>
        {
            Ok((key.clone(), storage_dtype(class_name)?))
        }
        _ => bail!("Unrecognised tensor persistent id"),
    }
}

/// Map a legacy storage class name to a dtype
pub fn storage_dtype(class_name: &str) -> Result<DType> {
    let dtype = match class_name {
        "FloatStorage" => DType::F32,
        "DoubleStorage" => DType::F64,
        "HalfStorage" => DType::F16,
        "BFloat16Storage" => DType::BF16,
        "LongStorage" => DType::I64,
        "ByteStorage" => DType::U8,
        other => bail!("Unsupported storage type: {}", other),
    };
    Ok(dtype)
}

fn int_value(obj: &Object) -> Result<usize> {
    match obj {
        Object::Int(v) => usize::try_from(*v).context("Negative integer"),
        _ => bail!("Expected an integer"),
    }
}

fn int_tuple(obj: &Object) -> Result<Vec<usize>> {
    match obj {
        Object::Tuple(items) => items.iter().map(int_value).collect(),
        _ => bail!("Expected a tuple of integers"),
    }
}
