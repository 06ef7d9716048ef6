//! Conversions between the native graph types and the SavedModel protos.

use std::collections::BTreeMap;

use bundleport_core::{
    AttrValue, DType, Dim, Error, ExecutionContext, Graph, MethodContract, Node, ProducerInfo,
    Result, Shape, Signature, SignatureMap, TensorDescriptor, TensorValue,
};
use bundleport_proto::saved_model::{
    self as pb,
    attr_value::{ListValue, Value},
    collection_def, tensor_shape_proto, DataType,
};
use bytes::Bytes;

/// Attributes carrying per-output tensor descriptors on every node.
pub(crate) const OUTPUT_NAMES_ATTR: &str = "_output_names";
pub(crate) const OUTPUT_SHAPES_ATTR: &str = "_output_shapes";
pub(crate) const OUTPUT_TYPES_ATTR: &str = "_output_types";
/// Const node payload.
pub(crate) const VALUE_ATTR: &str = "value";

pub(crate) const GRAPH_NAME_COLLECTION: &str = "graph_name";
pub(crate) const GRAPH_INPUTS_COLLECTION: &str = "graph_inputs";
pub(crate) const GRAPH_OUTPUTS_COLLECTION: &str = "graph_outputs";
/// `[name, version]` of the tool that produced the source model.
pub(crate) const PRODUCER_COLLECTION: &str = "producer";
pub(crate) const OPSET_COLLECTION: &str = "opset";

pub(crate) fn dtype_to_pb(dtype: DType) -> DataType {
    match dtype {
        DType::F32 => DataType::DtFloat,
        DType::F64 => DataType::DtDouble,
        DType::F16 => DataType::DtHalf,
        DType::I8 => DataType::DtInt8,
        DType::I32 => DataType::DtInt32,
        DType::I64 => DataType::DtInt64,
        DType::U8 => DataType::DtUint8,
        DType::Bool => DataType::DtBool,
    }
}

pub(crate) fn pb_to_dtype(raw: i32) -> Result<Option<DType>> {
    let dtype = DataType::try_from(raw).map_err(|_| Error::Decode {
        what: "dtype".to_string(),
        reason: format!("unknown dtype enum value {raw}"),
    })?;
    Ok(Some(match dtype {
        DataType::DtInvalid => return Ok(None),
        DataType::DtFloat => DType::F32,
        DataType::DtDouble => DType::F64,
        DataType::DtHalf => DType::F16,
        DataType::DtInt8 => DType::I8,
        DataType::DtInt32 => DType::I32,
        DataType::DtInt64 => DType::I64,
        DataType::DtUint8 => DType::U8,
        DataType::DtBool => DType::Bool,
        other => {
            return Err(Error::Decode {
                what: "dtype".to_string(),
                reason: format!("unsupported dtype {other:?}"),
            })
        }
    }))
}

fn opt_dtype_to_pb(dtype: Option<DType>) -> i32 {
    dtype.map(dtype_to_pb).unwrap_or(DataType::DtInvalid) as i32
}

pub(crate) fn shape_to_pb(shape: Option<&Shape>) -> pb::TensorShapeProto {
    let Some(shape) = shape else {
        return pb::TensorShapeProto {
            dim: Vec::new(),
            unknown_rank: true,
        };
    };
    pb::TensorShapeProto {
        dim: shape
            .dims()
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => tensor_shape_proto::Dim {
                    size: *n as i64,
                    name: String::new(),
                },
                Dim::Symbolic(name) => tensor_shape_proto::Dim {
                    size: -1,
                    name: name.clone(),
                },
                Dim::Unknown => tensor_shape_proto::Dim {
                    size: -1,
                    name: String::new(),
                },
            })
            .collect(),
        unknown_rank: false,
    }
}

pub(crate) fn pb_to_shape(shape: &pb::TensorShapeProto) -> Option<Shape> {
    if shape.unknown_rank {
        return None;
    }
    Some(Shape::from_dims(shape.dim.iter().map(|d| {
        if d.size >= 0 {
            Dim::Fixed(d.size as usize)
        } else if !d.name.is_empty() {
            Dim::Symbolic(d.name.clone())
        } else {
            Dim::Unknown
        }
    })))
}

pub(crate) fn value_to_pb(value: &TensorValue) -> pb::TensorProto {
    pb::TensorProto {
        dtype: dtype_to_pb(value.dtype) as i32,
        tensor_shape: Some(shape_to_pb(Some(&value.shape()))),
        version_number: 0,
        tensor_content: value.bytes.to_vec(),
    }
}

pub(crate) fn pb_to_value(t: &pb::TensorProto) -> Result<TensorValue> {
    let dtype = pb_to_dtype(t.dtype)?.ok_or_else(|| Error::Decode {
        what: "tensor".to_string(),
        reason: "tensor has no dtype".to_string(),
    })?;
    let dims = t
        .tensor_shape
        .as_ref()
        .and_then(pb_to_shape)
        .and_then(|s| s.concrete())
        .ok_or_else(|| Error::Decode {
            what: "tensor".to_string(),
            reason: "tensor shape is not concrete".to_string(),
        })?;
    TensorValue::from_bytes(dtype, &dims, Bytes::copy_from_slice(&t.tensor_content))
}

fn attr_to_pb(attr: &AttrValue) -> pb::AttrValue {
    let value = match attr {
        AttrValue::Int(i) => Value::I(*i),
        AttrValue::Float(f) => Value::F(*f),
        AttrValue::Bool(b) => Value::B(*b),
        AttrValue::Str(s) => Value::S(s.as_bytes().to_vec()),
        AttrValue::Type(t) => Value::Type(dtype_to_pb(*t) as i32),
        AttrValue::Shape(s) => Value::Shape(shape_to_pb(Some(s))),
        AttrValue::Tensor(t) => Value::Tensor(value_to_pb(t)),
        AttrValue::Ints(v) => Value::List(ListValue {
            i: v.clone(),
            ..Default::default()
        }),
        AttrValue::Floats(v) => Value::List(ListValue {
            f: v.clone(),
            ..Default::default()
        }),
        AttrValue::Strs(v) => Value::List(ListValue {
            s: v.iter().map(|s| s.as_bytes().to_vec()).collect(),
            ..Default::default()
        }),
    };
    pb::AttrValue { value: Some(value) }
}

fn pb_to_attr(attr: &pb::AttrValue) -> Result<Option<AttrValue>> {
    let Some(value) = &attr.value else {
        return Ok(None);
    };
    Ok(Some(match value {
        Value::I(i) => AttrValue::Int(*i),
        Value::F(f) => AttrValue::Float(*f),
        Value::B(b) => AttrValue::Bool(*b),
        Value::S(s) => AttrValue::Str(String::from_utf8_lossy(s).into_owned()),
        Value::Type(t) => match pb_to_dtype(*t)? {
            Some(dtype) => AttrValue::Type(dtype),
            None => return Ok(None),
        },
        Value::Shape(s) => match pb_to_shape(s) {
            Some(shape) => AttrValue::Shape(shape),
            None => return Ok(None),
        },
        Value::Tensor(t) => AttrValue::Tensor(pb_to_value(t)?),
        Value::List(list) if !list.f.is_empty() => AttrValue::Floats(list.f.clone()),
        Value::List(list) if !list.s.is_empty() => AttrValue::Strs(
            list.s
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect(),
        ),
        Value::List(list) => AttrValue::Ints(list.i.clone()),
    }))
}

pub(crate) fn graph_to_pb(ctx: &ExecutionContext) -> Result<pb::GraphDef> {
    let graph = &ctx.graph;
    let mut nodes = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let mut attr: BTreeMap<String, pb::AttrValue> = node
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), attr_to_pb(v)))
            .collect();

        let outputs = node
            .outputs
            .iter()
            .map(|o| graph.tensor(o))
            .collect::<Result<Vec<_>>>()?;
        attr.insert(
            OUTPUT_NAMES_ATTR.to_string(),
            attr_to_pb(&AttrValue::Strs(node.outputs.clone())),
        );
        attr.insert(
            OUTPUT_SHAPES_ATTR.to_string(),
            pb::AttrValue {
                value: Some(Value::List(ListValue {
                    shape: outputs.iter().map(|d| shape_to_pb(d.shape.as_ref())).collect(),
                    ..Default::default()
                })),
            },
        );
        attr.insert(
            OUTPUT_TYPES_ATTR.to_string(),
            pb::AttrValue {
                value: Some(Value::List(ListValue {
                    r#type: outputs.iter().map(|d| opt_dtype_to_pb(d.dtype)).collect(),
                    ..Default::default()
                })),
            },
        );

        if node.op == "Const" {
            let tensor = node.outputs.first().unwrap_or(&node.name);
            let value = ctx.constants.get(tensor).ok_or_else(|| {
                Error::InvalidModel(format!("Const node {:?} has no value", node.name))
            })?;
            attr.insert(VALUE_ATTR.to_string(), attr_to_pb(&AttrValue::Tensor(value.clone())));
        }

        nodes.push(pb::NodeDef {
            name: node.name.clone(),
            op: node.op.clone(),
            input: node.inputs.clone(),
            device: String::new(),
            attr,
        });
    }

    Ok(pb::GraphDef {
        node: nodes,
        versions: Some(pb::VersionDef {
            producer: 1,
            min_consumer: 0,
        }),
    })
}

/// Rebuilds the native graph and its constant values from a `GraphDef`.
pub(crate) fn pb_to_graph(
    def: &pb::GraphDef,
    name: &str,
    inputs: Vec<String>,
    outputs: Vec<String>,
) -> Result<(Graph, BTreeMap<String, TensorValue>)> {
    let mut graph = Graph::new(name);
    let mut constants = BTreeMap::new();

    for node_def in &def.node {
        let mut node = Node::new(&node_def.name, &node_def.op).with_inputs(node_def.input.iter());
        let mut out_names = Vec::new();
        let mut out_shapes = Vec::new();
        let mut out_types = Vec::new();
        let mut value = None;

        for (key, attr) in &node_def.attr {
            match key.as_str() {
                OUTPUT_NAMES_ATTR => {
                    if let Some(Value::List(list)) = &attr.value {
                        out_names = list
                            .s
                            .iter()
                            .map(|s| String::from_utf8_lossy(s).into_owned())
                            .collect();
                    }
                }
                OUTPUT_SHAPES_ATTR => {
                    if let Some(Value::List(list)) = &attr.value {
                        out_shapes = list.shape.iter().map(pb_to_shape).collect();
                    }
                }
                OUTPUT_TYPES_ATTR => {
                    if let Some(Value::List(list)) = &attr.value {
                        out_types = list
                            .r#type
                            .iter()
                            .map(|t| pb_to_dtype(*t))
                            .collect::<Result<Vec<_>>>()?;
                    }
                }
                VALUE_ATTR if node_def.op == "Const" => {
                    if let Some(Value::Tensor(t)) = &attr.value {
                        value = Some(pb_to_value(t)?);
                    }
                }
                _ => {
                    if let Some(parsed) = pb_to_attr(attr)? {
                        node.attrs.insert(key.clone(), parsed);
                    }
                }
            }
        }

        if out_names.is_empty() {
            out_names.push(node_def.name.clone());
        }
        for (i, out) in out_names.iter().enumerate() {
            graph.declare(TensorDescriptor {
                name: out.clone(),
                dtype: out_types.get(i).copied().flatten(),
                shape: out_shapes.get(i).cloned().flatten(),
            });
        }
        if let Some(value) = value {
            constants.insert(out_names[0].clone(), value);
        }
        node.outputs = out_names;
        graph.add_node(node);
    }

    graph.inputs = inputs;
    graph.outputs = outputs;
    graph.validate()?;
    Ok((graph, constants))
}

fn descriptor_to_info(desc: &TensorDescriptor) -> pb::TensorInfo {
    pb::TensorInfo {
        name: desc.name.clone(),
        dtype: opt_dtype_to_pb(desc.dtype),
        tensor_shape: Some(shape_to_pb(desc.shape.as_ref())),
    }
}

fn info_to_descriptor(info: &pb::TensorInfo) -> Result<TensorDescriptor> {
    Ok(TensorDescriptor {
        name: info.name.clone(),
        dtype: pb_to_dtype(info.dtype)?,
        shape: info.tensor_shape.as_ref().and_then(pb_to_shape),
    })
}

pub(crate) fn signatures_to_pb(signatures: &SignatureMap) -> BTreeMap<String, pb::SignatureDef> {
    signatures
        .iter()
        .map(|(key, sig)| {
            let def = pb::SignatureDef {
                inputs: sig
                    .inputs
                    .iter()
                    .map(|(k, d)| (k.clone(), descriptor_to_info(d)))
                    .collect(),
                outputs: sig
                    .outputs
                    .iter()
                    .map(|(k, d)| (k.clone(), descriptor_to_info(d)))
                    .collect(),
                method_name: sig.method.method_name().to_string(),
            };
            (key.clone(), def)
        })
        .collect()
}

pub(crate) fn pb_to_signatures(defs: &BTreeMap<String, pb::SignatureDef>) -> Result<SignatureMap> {
    let mut map = SignatureMap::new();
    for (key, def) in defs {
        let side = |m: &BTreeMap<String, pb::TensorInfo>| {
            m.iter()
                .map(|(k, info)| -> Result<(String, TensorDescriptor)> {
                    Ok((k.clone(), info_to_descriptor(info)?))
                })
                .collect::<Result<BTreeMap<_, _>>>()
        };
        map.insert(
            key.clone(),
            Signature {
                method: MethodContract::from_method_name(&def.method_name)?,
                inputs: side(&def.inputs)?,
                outputs: side(&def.outputs)?,
            },
        );
    }
    Ok(map)
}

fn node_list(values: Vec<String>) -> pb::CollectionDef {
    pb::CollectionDef {
        kind: Some(collection_def::Kind::NodeList(collection_def::NodeList { value: values })),
    }
}

fn collection_nodes(meta: &pb::MetaGraphDef, key: &str) -> Vec<String> {
    match meta.collection_def.get(key).and_then(|c| c.kind.as_ref()) {
        Some(collection_def::Kind::NodeList(list)) => list.value.clone(),
        _ => Vec::new(),
    }
}

/// Builds the single meta graph a bundle carries.
pub(crate) fn meta_graph_to_pb(
    ctx: &ExecutionContext,
    signatures: &SignatureMap,
    tags: &[String],
) -> Result<pb::MetaGraphDef> {
    let mut collections = BTreeMap::new();
    collections.insert(
        GRAPH_NAME_COLLECTION.to_string(),
        node_list(vec![ctx.graph.name.clone()]),
    );
    collections.insert(
        GRAPH_INPUTS_COLLECTION.to_string(),
        node_list(ctx.graph.inputs.clone()),
    );
    collections.insert(
        GRAPH_OUTPUTS_COLLECTION.to_string(),
        node_list(ctx.graph.outputs.clone()),
    );
    collections.insert(
        PRODUCER_COLLECTION.to_string(),
        pb::CollectionDef {
            kind: Some(collection_def::Kind::BytesList(collection_def::BytesList {
                value: vec![
                    ctx.producer.name.as_bytes().to_vec(),
                    ctx.producer.version.as_bytes().to_vec(),
                ],
            })),
        },
    );
    collections.insert(
        OPSET_COLLECTION.to_string(),
        pb::CollectionDef {
            kind: Some(collection_def::Kind::Int64List(collection_def::Int64List {
                value: vec![ctx.producer.opset],
            })),
        },
    );

    Ok(pb::MetaGraphDef {
        meta_info_def: Some(pb::MetaInfoDef {
            meta_graph_version: format!("bundleport-{}", env!("CARGO_PKG_VERSION")),
            tags: tags.to_vec(),
            tensorflow_version: String::new(),
            tensorflow_git_version: String::new(),
        }),
        graph_def: Some(graph_to_pb(ctx)?),
        collection_def: collections,
        signature_def: signatures_to_pb(signatures),
    })
}

/// Inverse of [`meta_graph_to_pb`]. Variable values are read separately.
pub(crate) fn pb_to_meta_graph(
    meta: &pb::MetaGraphDef,
) -> Result<(ExecutionContext, SignatureMap)> {
    let def = meta
        .graph_def
        .as_ref()
        .ok_or_else(|| Error::InvalidModel("meta graph has no graph_def".to_string()))?;
    let name = collection_nodes(meta, GRAPH_NAME_COLLECTION)
        .into_iter()
        .next()
        .unwrap_or_default();
    let (graph, constants) = pb_to_graph(
        def,
        &name,
        collection_nodes(meta, GRAPH_INPUTS_COLLECTION),
        collection_nodes(meta, GRAPH_OUTPUTS_COLLECTION),
    )?;

    let mut producer = ProducerInfo::default();
    if let Some(collection_def::Kind::BytesList(list)) = meta
        .collection_def
        .get(PRODUCER_COLLECTION)
        .and_then(|c| c.kind.as_ref())
    {
        let mut fields = list.value.iter().map(|v| String::from_utf8_lossy(v).into_owned());
        producer.name = fields.next().unwrap_or_default();
        producer.version = fields.next().unwrap_or_default();
    }
    if let Some(collection_def::Kind::Int64List(list)) = meta
        .collection_def
        .get(OPSET_COLLECTION)
        .and_then(|c| c.kind.as_ref())
    {
        producer.opset = list.value.first().copied().unwrap_or_default();
    }

    let ctx = ExecutionContext {
        graph,
        constants,
        variables: BTreeMap::new(),
        producer,
    };
    Ok((ctx, pb_to_signatures(&meta.signature_def)?))
}
