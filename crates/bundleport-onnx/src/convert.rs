use std::collections::{BTreeMap, HashMap, HashSet};

use bundleport_core::{
    AttrValue, DType, Dim, Error, ExecutionContext, Graph, Node, ProducerInfo, Result, Shape,
    TensorDescriptor, TensorValue,
};
use bundleport_proto::onnx;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::infer;
use crate::loader::{onnx_elem_to_dtype, tensor_value, value_info_descriptor};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    /// Store initializers as variables (persisted under `variables/`) instead of
    /// embedding them in the graph as constants.
    pub initializers_as_variables: bool,
    /// Overrides the graph name recorded in the model.
    pub graph_name: Option<String>,
}

/// Translates an ONNX model into a native graph held by a new context.
pub fn convert(model: &onnx::ModelProto, options: &ConvertOptions) -> Result<ExecutionContext> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| Error::InvalidModel("onnx model has no graph".to_string()))?;

    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .unwrap_or(1);

    let name = options
        .graph_name
        .clone()
        .unwrap_or_else(|| graph.name.clone());

    let mut cx = Converter::new(name, opset, options);
    cx.add_initializers(&graph.initializer)?;
    cx.add_inputs(&graph.input)?;
    cx.collect_declared(graph.value_info.iter().chain(&graph.output))?;

    for node in &graph.node {
        cx.translate(node)?;
    }

    for output in &graph.output {
        if let Some(node) = cx.secondary.get(&output.name) {
            return Err(secondary_output(node, &output.name));
        }
        if !cx.graph.tensors.contains_key(&output.name) {
            return Err(Error::InvalidModel(format!(
                "graph output {:?} is never produced",
                output.name
            )));
        }
        cx.graph.outputs.push(output.name.clone());
    }
    cx.graph.validate()?;

    info!(
        graph = %cx.graph.name,
        opset,
        nodes = cx.graph.nodes.len(),
        tensors = cx.graph.tensors.len(),
        "converted onnx graph"
    );

    Ok(ExecutionContext {
        graph: cx.graph,
        constants: cx.constants,
        variables: cx.variables,
        producer: ProducerInfo {
            name: model.producer_name.clone(),
            version: model.producer_version.clone(),
            opset,
        },
    })
}

struct Converter<'a> {
    graph: Graph,
    constants: BTreeMap<String, TensorValue>,
    variables: BTreeMap<String, TensorValue>,
    /// Types declared by the ONNX graph for non-input tensors.
    declared: HashMap<String, TensorDescriptor>,
    /// Outputs past the first, which no native op produces, mapped to their node.
    secondary: HashMap<String, onnx::NodeProto>,
    opset: i64,
    options: &'a ConvertOptions,
}

type Attrs = BTreeMap<String, AttrValue>;

impl<'a> Converter<'a> {
    fn new(name: String, opset: i64, options: &'a ConvertOptions) -> Self {
        Self {
            graph: Graph::new(name),
            constants: BTreeMap::new(),
            variables: BTreeMap::new(),
            declared: HashMap::new(),
            secondary: HashMap::new(),
            opset,
            options,
        }
    }

    fn add_initializers(&mut self, initializers: &[onnx::TensorProto]) -> Result<()> {
        for init in initializers {
            let value = tensor_value(init)?;
            let op = if self.options.initializers_as_variables {
                "VariableV2"
            } else {
                "Const"
            };
            let mut node = Node::new(&init.name, op)
                .with_outputs([init.name.as_str()])
                .with_attr("dtype", AttrValue::Type(value.dtype));
            if self.options.initializers_as_variables {
                node = node.with_attr("shape", AttrValue::Shape(value.shape()));
            }
            self.graph.add_node(node);
            self.graph.declare(TensorDescriptor::new(
                &init.name,
                value.dtype,
                value.shape(),
            ));
            if self.options.initializers_as_variables {
                self.variables.insert(init.name.clone(), value);
            } else {
                self.constants.insert(init.name.clone(), value);
            }
        }
        Ok(())
    }

    fn add_inputs(&mut self, inputs: &[onnx::ValueInfoProto]) -> Result<()> {
        for input in inputs {
            // Older exporters list initializers as graph inputs too.
            if self.graph.tensors.contains_key(&input.name) {
                continue;
            }
            let desc = value_info_descriptor(input)?;
            let mut node = Node::new(&input.name, "Placeholder").with_outputs([input.name.as_str()]);
            if let Some(dtype) = desc.dtype {
                node = node.with_attr("dtype", AttrValue::Type(dtype));
            }
            if let Some(shape) = &desc.shape {
                node = node.with_attr("shape", AttrValue::Shape(shape.clone()));
            }
            self.graph.add_node(node);
            self.graph.inputs.push(input.name.clone());
            self.graph.declare(desc);
        }
        Ok(())
    }

    fn collect_declared<'v>(
        &mut self,
        infos: impl Iterator<Item = &'v onnx::ValueInfoProto>,
    ) -> Result<()> {
        for info in infos {
            let desc = value_info_descriptor(info)?;
            self.declared.insert(desc.name.clone(), desc);
        }
        Ok(())
    }

    fn desc(&self, name: &str) -> Result<&TensorDescriptor> {
        if let Some(node) = self.secondary.get(name) {
            return Err(secondary_output(node, name));
        }
        self.graph.tensor(name).map_err(|_| {
            Error::InvalidModel(format!("tensor {name:?} is used before it is produced"))
        })
    }

    fn input_desc(&self, node: &onnx::NodeProto, idx: usize) -> Result<TensorDescriptor> {
        let name = node
            .input
            .get(idx)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::InvalidModel(format!(
                    "{} node {:?} is missing input #{idx}",
                    node.op_type, node.name
                ))
            })?;
        self.desc(name).cloned()
    }

    fn output_name<'n>(&self, node: &'n onnx::NodeProto) -> Result<&'n str> {
        node.output
            .first()
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::InvalidModel(format!("{} node {:?} has no output", node.op_type, node.name))
            })
    }

    fn const_value(&self, name: &str) -> Option<&TensorValue> {
        self.constants.get(name)
    }

    /// Emits one native node and declares its outputs. Declared ONNX types win
    /// over inferred ones.
    ///
    /// The node takes the name of its first output, so every tensor reference
    /// in the graph is also a node reference. Ops parameterised by their input
    /// type get `T` from the first input.
    fn emit(
        &mut self,
        op: &str,
        inputs: Vec<String>,
        outputs: Vec<TensorDescriptor>,
        mut attrs: Attrs,
    ) {
        if !matches!(op, "Const" | "Cast") {
            let first = inputs.first().and_then(|i| self.graph.tensors.get(i));
            if let Some(dtype) = first.and_then(|d| d.dtype) {
                attrs.entry("T".to_string()).or_insert(AttrValue::Type(dtype));
            }
        }
        let name = outputs.first().map(|d| d.name.clone()).unwrap_or_default();
        let mut node = Node::new(name, op)
            .with_inputs(inputs.into_iter().filter(|i| !i.is_empty()))
            .with_outputs(outputs.iter().map(|d| d.name.clone()));
        node.attrs = attrs;
        for inferred in outputs {
            let desc = match self.declared.get(&inferred.name) {
                Some(declared) => TensorDescriptor {
                    name: inferred.name,
                    dtype: declared.dtype.or(inferred.dtype),
                    shape: declared.shape.clone().or(inferred.shape),
                },
                None => inferred,
            };
            self.graph.declare(desc);
        }
        debug!(node = %node.name, op = %node.op, "emitted node");
        self.graph.add_node(node);
    }

    fn emit_const(&mut self, name: String, value: TensorValue) {
        let desc = TensorDescriptor::new(&name, value.dtype, value.shape());
        let attrs = Attrs::from([("dtype".to_string(), AttrValue::Type(value.dtype))]);
        self.constants.insert(name, value);
        self.emit("Const", Vec::new(), vec![desc], attrs);
    }

    fn translate(&mut self, node: &onnx::NodeProto) -> Result<()> {
        if !(node.domain.is_empty() || node.domain == "ai.onnx") {
            return Err(unsupported(node));
        }
        for extra in node.output.iter().skip(1).filter(|o| !o.is_empty()) {
            self.secondary.insert(extra.clone(), node.clone());
        }

        match node.op_type.as_str() {
            "Relu" | "Sigmoid" | "Tanh" | "Exp" | "Log" | "Sqrt" | "Neg" | "Abs" | "Elu"
            | "Identity" | "Dropout" => self.unary(node),
            "LeakyRelu" => {
                let alpha = attr_f(node, "alpha").unwrap_or(0.01);
                let attrs = Attrs::from([("alpha".to_string(), AttrValue::Float(alpha))]);
                self.unary_with(node, "LeakyRelu", attrs)
            }
            "Softmax" | "LogSoftmax" => self.softmax(node),
            "Add" | "Sub" | "Mul" | "Div" | "Pow" => self.binary(node),
            "MatMul" => self.matmul(node),
            "Gemm" => self.gemm(node),
            "Reshape" => self.reshape(node),
            "Flatten" => self.flatten(node),
            "Transpose" => self.transpose(node),
            "Concat" => self.concat(node),
            "Conv" => self.conv(node),
            "MaxPool" | "AveragePool" => self.pool(node),
            "GlobalAveragePool" => self.global_avg_pool(node),
            "BatchNormalization" => self.batch_norm(node),
            "ArgMax" => self.argmax(node),
            "Constant" => self.constant(node),
            "Shape" => self.shape_op(node),
            "Cast" => self.cast(node),
            _ => Err(unsupported(node)),
        }
    }

    fn unary(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let op = match node.op_type.as_str() {
            "Dropout" => "Identity",
            other => other,
        };
        self.unary_with(node, op, Attrs::new())
    }

    fn unary_with(&mut self, node: &onnx::NodeProto, op: &str, attrs: Attrs) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?;
        self.emit(
            op,
            vec![x.name.clone()],
            vec![like(out, &x)],
            attrs,
        );
        Ok(())
    }

    fn softmax(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?;
        // Opset 13 moved the default from the coerced-2D axis 1 to the last axis.
        let default_axis = if self.opset >= 13 { -1 } else { 1 };
        let axis = attr_i(node, "axis").unwrap_or(default_axis);
        // The native op always reduces over the last axis.
        let last = match x.shape.as_ref() {
            Some(s) => infer::normalize_axis(axis, s.rank())? + 1 == s.rank(),
            None => axis == -1,
        };
        if !last {
            return Err(unsupported(node));
        }
        self.emit(&node.op_type, vec![x.name.clone()], vec![like(out, &x)], Attrs::new());
        Ok(())
    }

    fn binary(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let a = self.input_desc(node, 0)?;
        let b = self.input_desc(node, 1)?;
        let out = self.output_name(node)?;
        let op = match node.op_type.as_str() {
            "Add" => "AddV2",
            "Div" => "RealDiv",
            other => other,
        };
        let shape = infer::broadcast(a.shape.as_ref(), b.shape.as_ref())?;
        self.emit(
            op,
            vec![a.name.clone(), b.name.clone()],
            vec![typed(out, a.dtype.or(b.dtype), shape)],
            Attrs::new(),
        );
        Ok(())
    }

    fn matmul(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let a = self.input_desc(node, 0)?;
        let b = self.input_desc(node, 1)?;
        let out = self.output_name(node)?;
        let shape = infer::matmul(a.shape.as_ref(), b.shape.as_ref())?;
        let batched = [&a, &b]
            .iter()
            .any(|d| d.shape.as_ref().is_some_and(|s| s.rank() > 2));
        let (op, flags) = if batched {
            ("BatchMatMulV2", ["adj_x", "adj_y"])
        } else {
            ("MatMul", ["transpose_a", "transpose_b"])
        };
        let attrs = flags
            .iter()
            .map(|f| (f.to_string(), AttrValue::Bool(false)))
            .collect();
        self.emit(
            op,
            vec![a.name.clone(), b.name.clone()],
            vec![typed(out, a.dtype, shape)],
            attrs,
        );
        Ok(())
    }

    /// `alpha * op(A) @ op(B) + beta * C` as MatMul, optional Mul scalings and AddV2.
    fn gemm(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let a = self.input_desc(node, 0)?;
        let b = self.input_desc(node, 1)?;
        let out = self.output_name(node)?.to_string();
        let trans_a = attr_i(node, "transA").unwrap_or(0) != 0;
        let trans_b = attr_i(node, "transB").unwrap_or(0) != 0;
        let alpha = attr_f(node, "alpha").unwrap_or(1.0);
        let beta = attr_f(node, "beta").unwrap_or(1.0);
        let has_c = node.input.get(2).is_some_and(|c| !c.is_empty());
        let dtype = a.dtype;
        let shape = infer::gemm(a.shape.as_ref(), b.shape.as_ref(), trans_a, trans_b);

        let single = !has_c && alpha == 1.0;
        let mut product = if single {
            out.clone()
        } else {
            format!("{out}/matmul")
        };
        self.emit(
            "MatMul",
            vec![a.name.clone(), b.name.clone()],
            vec![typed(&product, dtype, shape.clone())],
            Attrs::from([
                ("transpose_a".to_string(), AttrValue::Bool(trans_a)),
                ("transpose_b".to_string(), AttrValue::Bool(trans_b)),
            ]),
        );

        if alpha != 1.0 {
            let scaled = if has_c { format!("{out}/alpha_mul") } else { out.clone() };
            self.emit_const(format!("{out}/alpha"), TensorValue::from_f32(&[], &[alpha])?);
            self.emit(
                "Mul",
                vec![product, format!("{out}/alpha")],
                vec![typed(&scaled, dtype, shape.clone())],
                Attrs::new(),
            );
            product = scaled;
        }

        if has_c {
            let mut c = self.input_desc(node, 2)?;
            if beta != 1.0 {
                let scaled = format!("{out}/beta_mul");
                self.emit_const(format!("{out}/beta"), TensorValue::from_f32(&[], &[beta])?);
                self.emit(
                    "Mul",
                    vec![c.name.clone(), format!("{out}/beta")],
                    vec![typed(&scaled, c.dtype, c.shape.clone())],
                    Attrs::new(),
                );
                c = self.desc(&scaled)?.clone();
            }
            let sum_shape = infer::broadcast(shape.as_ref(), c.shape.as_ref())?;
            self.emit(
                "AddV2",
                vec![product, c.name.clone()],
                vec![typed(&out, dtype, sum_shape)],
                Attrs::new(),
            );
        }
        Ok(())
    }

    fn reshape(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let target = self.input_desc(node, 1)?;
        let out = self.output_name(node)?;
        let allow_zero = attr_i(node, "allowzero").unwrap_or(0) != 0;
        let shape = match self.const_value(&target.name) {
            Some(v) => Some(infer::reshape(x.shape.as_ref(), &v.to_i64_vec()?, allow_zero)?),
            None => None,
        };
        let tshape = target.dtype.unwrap_or(DType::I64);
        self.emit(
            "Reshape",
            vec![x.name.clone(), target.name.clone()],
            vec![typed(out, x.dtype, shape)],
            Attrs::from([("Tshape".to_string(), AttrValue::Type(tshape))]),
        );
        Ok(())
    }

    fn flatten(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?.to_string();
        let shape = x.shape.clone().ok_or_else(|| {
            Error::InvalidModel(format!("Flatten input {:?} has an unknown shape", x.name))
        })?;
        // Flatten accepts an axis in [-rank, rank].
        let rank = shape.rank() as i64;
        let raw_axis = attr_i(node, "axis").unwrap_or(1);
        let axis = if raw_axis < 0 { raw_axis + rank } else { raw_axis };
        if !(0..=rank).contains(&axis) {
            return Err(Error::InvalidModel(format!(
                "Flatten axis {raw_axis} out of range for rank {rank}"
            )));
        }
        let axis = axis as usize;
        let (outer, inner) = infer::flatten(&shape, axis);

        let (target, out_shape) = match (outer, inner) {
            (Some(o), Some(i)) => (vec![dim_i64(o)?, dim_i64(i)?], Shape::from_slice(&[o, i])),
            (None, Some(i)) => {
                let lead = if axis == 1 { shape.dims()[0].clone() } else { Dim::Unknown };
                (vec![-1, dim_i64(i)?], Shape::from_dims([lead, Dim::Fixed(i)]))
            }
            (Some(o), None) => (
                vec![dim_i64(o)?, -1],
                Shape::from_dims([Dim::Fixed(o), Dim::Unknown]),
            ),
            (None, None) => {
                return Err(Error::InvalidModel(format!(
                    "cannot flatten {:?} with shape {shape}",
                    x.name
                )))
            }
        };

        let shape_name = format!("{out}/shape");
        self.emit_const(shape_name.clone(), TensorValue::from_i64(&[2], &target)?);
        self.emit(
            "Reshape",
            vec![x.name.clone(), shape_name],
            vec![typed(&out, x.dtype, Some(out_shape))],
            Attrs::from([("Tshape".to_string(), AttrValue::Type(DType::I64))]),
        );
        Ok(())
    }

    fn transpose(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?.to_string();
        let perm: Vec<usize> = match attr_ints(node, "perm") {
            Some(p) => non_negative(node, "perm", p)?,
            None => {
                let rank = x.shape.as_ref().map(Shape::rank).ok_or_else(|| {
                    Error::InvalidModel(format!(
                        "Transpose of {:?} needs a perm or a known rank",
                        x.name
                    ))
                })?;
                (0..rank).rev().collect()
            }
        };
        let rank = x.shape.as_ref().map_or(perm.len(), Shape::rank);
        let mut seen = perm.clone();
        seen.sort_unstable();
        if perm.len() != rank || seen.iter().enumerate().any(|(i, &p)| i != p) {
            return Err(Error::InvalidModel(format!(
                "Transpose node {:?}: perm {perm:?} is not a permutation of rank {rank}",
                node.name
            )));
        }
        let perm_name = format!("{out}/perm");
        let perm_i64 = perm.iter().map(|&p| dim_i64(p)).collect::<Result<Vec<_>>>()?;
        self.emit_const(perm_name.clone(), TensorValue::from_i64(&[perm.len()], &perm_i64)?);
        let shape = infer::transpose(x.shape.as_ref(), &perm);
        self.emit(
            "Transpose",
            vec![x.name.clone(), perm_name],
            vec![typed(&out, x.dtype, shape)],
            Attrs::from([("Tperm".to_string(), AttrValue::Type(DType::I64))]),
        );
        Ok(())
    }

    fn concat(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let inputs = (0..node.input.len())
            .map(|i| self.input_desc(node, i))
            .collect::<Result<Vec<_>>>()?;
        let first = inputs
            .first()
            .ok_or_else(|| Error::InvalidModel(format!("Concat node {:?} has no inputs", node.name)))?;
        let out = self.output_name(node)?.to_string();
        let dtype = first.dtype;
        let axis_attr = attr_i(node, "axis").unwrap_or(0);
        let shape = match first.shape.as_ref() {
            Some(s) => {
                let axis = infer::normalize_axis(axis_attr, s.rank())?;
                let shapes: Vec<Option<&Shape>> = inputs.iter().map(|d| d.shape.as_ref()).collect();
                infer::concat(&shapes, axis)
            }
            None => None,
        };

        let axis_name = format!("{out}/axis");
        self.emit_const(axis_name.clone(), TensorValue::from_i64(&[], &[axis_attr])?);
        let mut names: Vec<String> = inputs.iter().map(|d| d.name.clone()).collect();
        names.push(axis_name);
        self.emit(
            "ConcatV2",
            names,
            vec![typed(&out, dtype, shape)],
            Attrs::from([
                ("N".to_string(), AttrValue::Int(inputs.len() as i64)),
                ("Tidx".to_string(), AttrValue::Type(DType::I64)),
            ]),
        );
        Ok(())
    }

    fn conv(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let w = self.input_desc(node, 1)?;
        let out = self.output_name(node)?.to_string();
        if attr_i(node, "group").unwrap_or(1) != 1 {
            return Err(unsupported(node));
        }
        let kernel = match w.shape.as_ref().and_then(Shape::concrete) {
            Some(dims) if dims.len() == 4 => dims,
            _ => return Err(unsupported(node)),
        };
        let window = Window::from_node(node, &kernel[2..])?;
        let shape = x.shape.as_ref().filter(|s| s.rank() == 4).map(|s| {
            Shape::from_dims([
                s.dims()[0].clone(),
                Dim::Fixed(kernel[0]),
                window.out_dim(&s.dims()[2], 0),
                window.out_dim(&s.dims()[3], 1),
            ])
        });

        let has_bias = node.input.get(2).is_some_and(|b| !b.is_empty());
        let conv_out = if has_bias { format!("{out}/conv") } else { out.clone() };
        self.emit(
            "Conv2D",
            vec![x.name.clone(), w.name.clone()],
            vec![typed(&conv_out, x.dtype, shape.clone())],
            window.attrs(true),
        );
        if has_bias {
            let bias = self.input_desc(node, 2)?;
            self.emit(
                "BiasAdd",
                vec![conv_out, bias.name.clone()],
                vec![typed(&out, x.dtype, shape)],
                Attrs::from([("data_format".to_string(), AttrValue::Str("NCHW".into()))]),
            );
        }
        Ok(())
    }

    fn pool(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?;
        let kernel = attr_ints(node, "kernel_shape")
            .filter(|k| k.len() == 2)
            .ok_or_else(|| unsupported(node))?;
        let kernel = positive(node, "kernel_shape", kernel)?;
        let window = Window::from_node(node, &kernel)?;
        let op = if node.op_type == "MaxPool" { "MaxPool" } else { "AvgPool" };
        // Pooling has no dilations, and AvgPool has no explicit padding.
        if window.dilations.iter().any(|&d| d != 1) || (op == "AvgPool" && window.padded()) {
            return Err(unsupported(node));
        }
        let shape = x.shape.as_ref().filter(|s| s.rank() == 4).map(|s| {
            Shape::from_dims([
                s.dims()[0].clone(),
                s.dims()[1].clone(),
                window.out_dim(&s.dims()[2], 0),
                window.out_dim(&s.dims()[3], 1),
            ])
        });
        let mut attrs = window.attrs(false);
        attrs.insert(
            "ksize".into(),
            AttrValue::Ints(vec![1, 1, dim_i64(kernel[0])?, dim_i64(kernel[1])?]),
        );
        self.emit(
            op,
            vec![x.name.clone()],
            vec![typed(out, x.dtype, shape)],
            attrs,
        );
        Ok(())
    }

    fn global_avg_pool(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?.to_string();
        let shape = x.shape.as_ref().filter(|s| s.rank() == 4).map(|s| {
            Shape::from_dims([s.dims()[0].clone(), s.dims()[1].clone(), Dim::Fixed(1), Dim::Fixed(1)])
        });
        let axes = format!("{out}/axes");
        self.emit_const(axes.clone(), TensorValue::from_i64(&[2], &[2, 3])?);
        self.emit(
            "Mean",
            vec![x.name.clone(), axes],
            vec![typed(&out, x.dtype, shape)],
            Attrs::from([
                ("keep_dims".to_string(), AttrValue::Bool(true)),
                ("Tidx".to_string(), AttrValue::Type(DType::I64)),
            ]),
        );
        Ok(())
    }

    fn batch_norm(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let inputs = (0..5)
            .map(|i| self.input_desc(node, i))
            .collect::<Result<Vec<_>>>()?;
        let out = self.output_name(node)?;
        let epsilon = attr_f(node, "epsilon").unwrap_or(1e-5);
        let param_dtype = inputs[1].dtype.or(inputs[0].dtype).unwrap_or(DType::F32);
        self.emit(
            "FusedBatchNormV3",
            inputs.iter().map(|d| d.name.clone()).collect(),
            vec![like(out, &inputs[0])],
            Attrs::from([
                ("epsilon".to_string(), AttrValue::Float(epsilon)),
                ("data_format".to_string(), AttrValue::Str("NCHW".into())),
                ("is_training".to_string(), AttrValue::Bool(false)),
                ("U".to_string(), AttrValue::Type(param_dtype)),
            ]),
        );
        Ok(())
    }

    fn argmax(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?.to_string();
        let keep_dims = attr_i(node, "keepdims").unwrap_or(1) != 0;
        let axis_attr = attr_i(node, "axis").unwrap_or(0);
        // (dropped, kept) output shapes.
        let (dropped, kept) = match x.shape.as_ref() {
            Some(s) => {
                let axis = infer::normalize_axis(axis_attr, s.rank())?;
                let mut kept = s.dims().to_vec();
                kept[axis] = Dim::Fixed(1);
                let mut dropped = s.dims().to_vec();
                dropped.remove(axis);
                (Some(Shape::from_dims(dropped)), Some(Shape::from_dims(kept)))
            }
            None => (None, None),
        };

        let axis_name = format!("{out}/axis");
        self.emit_const(axis_name.clone(), TensorValue::from_i64(&[], &[axis_attr])?);
        let argmax_out = if keep_dims { format!("{out}/argmax") } else { out.clone() };
        self.emit(
            "ArgMax",
            vec![x.name.clone(), axis_name.clone()],
            vec![typed(&argmax_out, Some(DType::I64), dropped)],
            Attrs::from([
                ("output_type".to_string(), AttrValue::Type(DType::I64)),
                ("Tidx".to_string(), AttrValue::Type(DType::I64)),
            ]),
        );
        if keep_dims {
            self.emit(
                "ExpandDims",
                vec![argmax_out, axis_name],
                vec![typed(&out, Some(DType::I64), kept)],
                Attrs::from([("Tdim".to_string(), AttrValue::Type(DType::I64))]),
            );
        }
        Ok(())
    }

    fn constant(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let out = self.output_name(node)?.to_string();
        let attr = node
            .attribute
            .first()
            .ok_or_else(|| Error::InvalidModel(format!("Constant node {:?} has no value", node.name)))?;
        let value = match attr.name.as_str() {
            "value" => {
                let t = attr.t.as_ref().ok_or_else(|| {
                    Error::InvalidModel(format!("Constant node {:?} has an empty tensor", node.name))
                })?;
                tensor_value(t)?
            }
            "value_float" => TensorValue::from_f32(&[], &[attr.f])?,
            "value_floats" => TensorValue::from_f32(&[attr.floats.len()], &attr.floats)?,
            "value_int" => TensorValue::from_i64(&[], &[attr.i])?,
            "value_ints" => TensorValue::from_i64(&[attr.ints.len()], &attr.ints)?,
            _ => return Err(unsupported(node)),
        };
        self.emit_const(out, value);
        Ok(())
    }

    fn shape_op(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?;
        let shape = x.shape.as_ref().map(|s| Shape::from_slice(&[s.rank()]));
        self.emit(
            "Shape",
            vec![x.name.clone()],
            vec![typed(out, Some(DType::I64), shape)],
            Attrs::from([("out_type".to_string(), AttrValue::Type(DType::I64))]),
        );
        Ok(())
    }

    fn cast(&mut self, node: &onnx::NodeProto) -> Result<()> {
        let x = self.input_desc(node, 0)?;
        let out = self.output_name(node)?;
        let to = attr_i(node, "to")
            .ok_or_else(|| Error::InvalidModel(format!("Cast node {:?} has no target", node.name)))?;
        let to = i32::try_from(to).map_err(|_| {
            Error::InvalidModel(format!("Cast node {:?} has target type {to}", node.name))
        })?;
        let dst = onnx_elem_to_dtype(to)?
            .ok_or_else(|| Error::InvalidModel(format!("Cast node {:?} targets UNDEFINED", node.name)))?;
        let mut attrs = Attrs::from([
            ("DstT".to_string(), AttrValue::Type(dst)),
            ("Truncate".to_string(), AttrValue::Bool(false)),
        ]);
        if let Some(src) = x.dtype {
            attrs.insert("SrcT".to_string(), AttrValue::Type(src));
        }
        self.emit(
            "Cast",
            vec![x.name.clone()],
            vec![typed(out, Some(dst), x.shape.clone())],
            attrs,
        );
        Ok(())
    }
}

/// Strides, pads and dilations of a 2D window (Conv or pooling).
struct Window {
    kernel: Vec<usize>,
    strides: Vec<usize>,
    pads: Vec<usize>,
    dilations: Vec<usize>,
}

impl Window {
    fn from_node(node: &onnx::NodeProto, kernel: &[usize]) -> Result<Self> {
        let get = |name: &str, default: usize, len: usize| -> Result<Vec<usize>> {
            let values = match attr_ints(node, name) {
                Some(v) if default > 0 => positive(node, name, v)?,
                Some(v) => non_negative(node, name, v)?,
                None => vec![default; len],
            };
            if values.len() != len {
                return Err(Error::InvalidModel(format!(
                    "{} node {:?}: {name} must have {len} entries",
                    node.op_type, node.name
                )));
            }
            Ok(values)
        };
        match attr_s(node, "auto_pad").as_deref() {
            None | Some("NOTSET") | Some("VALID") => {}
            Some(_) => return Err(unsupported(node)),
        }
        Ok(Self {
            kernel: kernel.to_vec(),
            strides: get("strides", 1, 2)?,
            pads: get("pads", 0, 4)?,
            dilations: get("dilations", 1, 2)?,
        })
    }

    fn padded(&self) -> bool {
        self.pads.iter().any(|&p| p != 0)
    }

    fn out_dim(&self, input: &Dim, axis: usize) -> Dim {
        let pad = self.pads[axis] + self.pads[axis + 2];
        infer::window_out(input, self.kernel[axis], self.strides[axis], pad, self.dilations[axis])
    }

    fn attrs(&self, with_dilations: bool) -> Attrs {
        let as_i64 = |v: &[usize]| v.iter().map(|&x| x as i64).collect::<Vec<_>>();
        let mut attrs = Attrs::from([
            ("data_format".to_string(), AttrValue::Str("NCHW".into())),
            (
                "strides".into(),
                AttrValue::Ints([vec![1, 1], as_i64(&self.strides)].concat()),
            ),
        ]);
        if self.padded() {
            // NCHW order, (before, after) per dimension.
            let p = &self.pads;
            attrs.insert("padding".to_string(), AttrValue::Str("EXPLICIT".into()));
            attrs.insert(
                "explicit_paddings".into(),
                AttrValue::Ints(as_i64(&[0, 0, 0, 0, p[0], p[2], p[1], p[3]])),
            );
        } else {
            attrs.insert("padding".to_string(), AttrValue::Str("VALID".into()));
        }
        if with_dilations {
            attrs.insert(
                "dilations".into(),
                AttrValue::Ints([vec![1, 1], as_i64(&self.dilations)].concat()),
            );
        }
        attrs
    }
}

fn unsupported(node: &onnx::NodeProto) -> Error {
    let op = if node.domain.is_empty() {
        node.op_type.clone()
    } else {
        format!("{}::{}", node.domain, node.op_type)
    };
    Error::UnsupportedOp {
        op,
        node: node.name.clone(),
    }
}

/// Only the first output of each node is translated.
fn secondary_output(node: &onnx::NodeProto, output: &str) -> Error {
    Error::UnsupportedOp {
        op: format!("{} output {output:?}", node.op_type),
        node: node.name.clone(),
    }
}

/// Integer attribute values used as sizes or indices.
fn non_negative(node: &onnx::NodeProto, attr: &str, values: &[i64]) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| {
                Error::InvalidModel(format!(
                    "{} node {:?}: {attr} has negative value {v}",
                    node.op_type, node.name
                ))
            })
        })
        .collect()
}

fn positive(node: &onnx::NodeProto, attr: &str, values: &[i64]) -> Result<Vec<usize>> {
    let values = non_negative(node, attr, values)?;
    if values.contains(&0) {
        return Err(Error::InvalidModel(format!(
            "{} node {:?}: {attr} must be positive",
            node.op_type, node.name
        )));
    }
    Ok(values)
}

fn dim_i64(n: usize) -> Result<i64> {
    i64::try_from(n).map_err(|_| Error::InvalidModel(format!("dimension {n} does not fit in i64")))
}

fn like(name: &str, src: &TensorDescriptor) -> TensorDescriptor {
    TensorDescriptor {
        name: name.to_string(),
        dtype: src.dtype,
        shape: src.shape.clone(),
    }
}

fn typed(name: &str, dtype: Option<DType>, shape: Option<Shape>) -> TensorDescriptor {
    TensorDescriptor {
        name: name.to_string(),
        dtype,
        shape,
    }
}

fn find_attr<'n>(node: &'n onnx::NodeProto, name: &str) -> Option<&'n onnx::AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_i(node: &onnx::NodeProto, name: &str) -> Option<i64> {
    find_attr(node, name).map(|a| a.i)
}

fn attr_f(node: &onnx::NodeProto, name: &str) -> Option<f32> {
    find_attr(node, name).map(|a| a.f)
}

fn attr_ints<'n>(node: &'n onnx::NodeProto, name: &str) -> Option<&'n [i64]> {
    find_attr(node, name).map(|a| a.ints.as_slice())
}

fn attr_s(node: &onnx::NodeProto, name: &str) -> Option<String> {
    find_attr(node, name).map(|a| String::from_utf8_lossy(&a.s).into_owned())
}

/// Names of every op the converter can translate.
pub fn supported_ops() -> HashSet<&'static str> {
    [
        "Relu", "Sigmoid", "Tanh", "Exp", "Log", "Sqrt", "Neg", "Abs", "Elu", "Identity",
        "Dropout", "LeakyRelu", "Softmax", "LogSoftmax", "Add", "Sub", "Mul", "Div", "Pow",
        "MatMul", "Gemm", "Reshape", "Flatten", "Transpose", "Concat", "Conv", "MaxPool",
        "AveragePool", "GlobalAveragePool", "BatchNormalization", "ArgMax", "Constant", "Shape",
        "Cast",
    ]
    .into_iter()
    .collect()
}
