use std::path::Path;

use bundleport_core::{DType, Dim, Error, Result, Shape, TensorDescriptor, TensorValue};
use bundleport_proto::onnx::{
    self, tensor_proto::DataType as OnnxDataType,
    tensor_shape_proto::dimension::Value as DimValue, type_proto,
};
use bytes::Bytes;
use prost::Message;
use tracing::debug;

/// Reads and decodes an ONNX model file.
pub fn load_model(path: impl AsRef<Path>) -> Result<onnx::ModelProto> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    debug!(path = %path.display(), bytes = bytes.len(), "read onnx model");
    load_model_from_bytes(&bytes)
}

pub fn load_model_from_bytes(bytes: &[u8]) -> Result<onnx::ModelProto> {
    let model = onnx::ModelProto::decode(bytes).map_err(|e| Error::Decode {
        what: "onnx model".to_string(),
        reason: e.to_string(),
    })?;
    if model.graph.is_none() {
        return Err(Error::InvalidModel("onnx model has no graph".to_string()));
    }
    Ok(model)
}

pub(crate) fn onnx_elem_to_dtype(raw: i32) -> Result<Option<DType>> {
    let ty = OnnxDataType::try_from(raw)
        .map_err(|_| Error::InvalidModel(format!("unknown onnx element type {raw}")))?;
    Ok(Some(match ty {
        OnnxDataType::Undefined => return Ok(None),
        OnnxDataType::Float => DType::F32,
        OnnxDataType::Double => DType::F64,
        OnnxDataType::Float16 => DType::F16,
        OnnxDataType::Int8 => DType::I8,
        OnnxDataType::Int32 => DType::I32,
        OnnxDataType::Int64 => DType::I64,
        OnnxDataType::Uint8 => DType::U8,
        OnnxDataType::Bool => DType::Bool,
        other => {
            return Err(Error::InvalidModel(format!(
                "unsupported onnx element type {other:?}"
            )))
        }
    }))
}

pub(crate) fn dtype_to_onnx_elem(dtype: DType) -> OnnxDataType {
    match dtype {
        DType::F32 => OnnxDataType::Float,
        DType::F64 => OnnxDataType::Double,
        DType::F16 => OnnxDataType::Float16,
        DType::I8 => OnnxDataType::Int8,
        DType::I32 => OnnxDataType::Int32,
        DType::I64 => OnnxDataType::Int64,
        DType::U8 => OnnxDataType::Uint8,
        DType::Bool => OnnxDataType::Bool,
    }
}

/// Descriptor for a graph input, output or `value_info` entry.
pub(crate) fn value_info_descriptor(info: &onnx::ValueInfoProto) -> Result<TensorDescriptor> {
    let Some(type_proto::Value::TensorType(tensor)) =
        info.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return Ok(TensorDescriptor::untyped(&info.name));
    };

    let dtype = onnx_elem_to_dtype(tensor.elem_type)?;
    let shape = tensor.shape.as_ref().map(|s| {
        Shape::from_dims(s.dim.iter().map(|d| match &d.value {
            Some(DimValue::DimValue(n)) if *n >= 0 => Dim::Fixed(*n as usize),
            Some(DimValue::DimParam(p)) if !p.is_empty() => Dim::Symbolic(p.clone()),
            _ => Dim::Unknown,
        }))
    });

    Ok(TensorDescriptor {
        name: info.name.clone(),
        dtype,
        shape,
    })
}

/// Decodes an initializer or constant attribute into native tensor contents.
pub(crate) fn tensor_value(t: &onnx::TensorProto) -> Result<TensorValue> {
    if t.data_location == 1 || !t.external_data.is_empty() {
        return Err(Error::InvalidModel(format!(
            "tensor {:?} stores its data externally, which is not supported",
            t.name
        )));
    }

    let dtype = onnx_elem_to_dtype(t.data_type)?
        .ok_or_else(|| Error::InvalidModel(format!("tensor {:?} has no data type", t.name)))?;
    let dims = t
        .dims
        .iter()
        .map(|d| {
            usize::try_from(*d).map_err(|_| {
                Error::InvalidModel(format!("tensor {:?} has negative dim {d}", t.name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = if !t.raw_data.is_empty() {
        Bytes::copy_from_slice(&t.raw_data)
    } else {
        typed_data_bytes(t, dtype)
    };

    TensorValue::from_bytes(dtype, &dims, bytes).map_err(|e| match e {
        Error::InvalidModel(reason) => Error::InvalidModel(format!("tensor {:?}: {reason}", t.name)),
        other => other,
    })
}

fn typed_data_bytes(t: &onnx::TensorProto, dtype: DType) -> Bytes {
    let bytes: Vec<u8> = match dtype {
        DType::F32 => t.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::F64 => t.double_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::I64 => t.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::I32 => t.int32_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        // Narrow types are widened to int32 in the proto.
        DType::F16 => t
            .int32_data
            .iter()
            .flat_map(|v| (*v as u16).to_le_bytes())
            .collect(),
        DType::I8 | DType::U8 | DType::Bool => t.int32_data.iter().map(|v| *v as u8).collect(),
    };
    Bytes::from(bytes)
}

/// Encodes native tensor contents as an ONNX tensor, using `raw_data`.
pub fn tensor_proto(name: &str, value: &TensorValue) -> onnx::TensorProto {
    onnx::TensorProto {
        dims: value.dims.iter().map(|d| *d as i64).collect(),
        data_type: dtype_to_onnx_elem(value.dtype) as i32,
        name: name.to_string(),
        raw_data: value.bytes.to_vec(),
        ..Default::default()
    }
}

/// Builds an ONNX `ValueInfoProto` for a descriptor.
pub fn value_info(desc: &TensorDescriptor) -> onnx::ValueInfoProto {
    let shape = desc.shape.as_ref().map(|s| onnx::TensorShapeProto {
        dim: s
            .dims()
            .iter()
            .map(|d| onnx::tensor_shape_proto::Dimension {
                denotation: String::new(),
                value: match d {
                    Dim::Fixed(n) => Some(DimValue::DimValue(*n as i64)),
                    Dim::Symbolic(p) => Some(DimValue::DimParam(p.clone())),
                    Dim::Unknown => None,
                },
            })
            .collect(),
    });
    onnx::ValueInfoProto {
        name: desc.name.clone(),
        r#type: Some(onnx::TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: desc
                    .dtype
                    .map(|d| dtype_to_onnx_elem(d) as i32)
                    .unwrap_or(0),
                shape,
            })),
        }),
        doc_string: String::new(),
    }
}
