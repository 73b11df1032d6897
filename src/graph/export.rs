//! Lowering of frozen graphs to ONNX and the artifact file on disk.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use prost::Message;

use super::freeze::FrozenGraph;
use super::ir::{Dim, Node, Op, TensorBinding};
use super::onnx::attribute_proto::AttributeType;
use super::onnx::tensor_proto::DataType;
use super::onnx::tensor_shape_proto::{Dimension, dimension};
use super::onnx::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, type_proto,
};
use crate::error::ExportError;
use crate::schema::DType;

pub const IR_VERSION: i64 = 7;
pub const OPSET_VERSION: i64 = 13;
pub const PRODUCER_NAME: &str = "keeplord-policy";
pub const BATCH_DIM_PARAM: &str = "batch";

/// Free-form key/value pairs recorded next to the graph.
pub type Metadata = Vec<(String, String)>;

impl FrozenGraph {
    /// Builds the ONNX model. Constants become initializers, every other
    /// non-input node becomes one ONNX node whose output carries its name.
    pub fn to_onnx(&self, graph_name: &str, metadata: &Metadata) -> ModelProto {
        let mut graph = GraphProto {
            name: graph_name.to_string(),
            ..Default::default()
        };

        let inputs = self.inputs();
        let outputs = self.outputs();

        for node in self.nodes() {
            match &node.op {
                Op::Input => {}
                Op::Constant(values) => graph.initializer.push(initializer(node, values)),
                // freezing leaves no variables behind
                Op::Variable => {}
                _ => {
                    graph.node.push(lower_node(node));
                    if !outputs.iter().any(|o| o.name == node.name) {
                        graph.value_info.push(value_info(&TensorBinding::of(node)));
                    }
                }
            }
        }
        graph.input = inputs.iter().map(value_info).collect();
        graph.output = outputs.iter().map(value_info).collect();

        ModelProto {
            ir_version: IR_VERSION,
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            metadata_props: metadata
                .iter()
                .map(|(key, value)| StringStringEntryProto {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

fn lower_node(node: &Node) -> NodeProto {
    let (op_type, attribute) = match &node.op {
        Op::Transpose { perm } => ("Transpose", vec![ints("perm", perm)]),
        Op::Conv2d { kernel, stride } => (
            "Conv",
            vec![
                ints("dilations", &[1, 1]),
                int("group", 1),
                ints("kernel_shape", kernel),
                ints("pads", &[0, 0, 0, 0]),
                ints("strides", stride),
            ],
        ),
        Op::MaxPool2d { kernel, stride } => (
            "MaxPool",
            vec![
                ints("kernel_shape", kernel),
                ints("pads", &[0, 0, 0, 0]),
                ints("strides", stride),
            ],
        ),
        Op::Relu => ("Relu", Vec::new()),
        Op::Flatten => ("Flatten", vec![int("axis", 1)]),
        Op::Gather => ("Gather", vec![int("axis", 0)]),
        Op::Concat { axis } => ("Concat", vec![int("axis", *axis as i64)]),
        Op::Dense => (
            "Gemm",
            vec![
                float("alpha", 1.0),
                float("beta", 1.0),
                int("transA", 0),
                int("transB", 0),
            ],
        ),
        Op::Softmax => ("Softmax", vec![int("axis", -1)]),
        Op::Identity => ("Identity", Vec::new()),
        Op::Input | Op::Variable | Op::Constant(_) => ("Identity", Vec::new()),
    };

    NodeProto {
        input: node.inputs.clone(),
        output: vec![node.name.clone()],
        name: node.name.clone(),
        op_type: op_type.to_string(),
        attribute,
        ..Default::default()
    }
}

fn initializer(node: &Node, values: &[f32]) -> TensorProto {
    let dims = node
        .shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => *n as i64,
            Dim::Batch => -1,
        })
        .collect();
    TensorProto {
        dims,
        data_type: DataType::Float as i32,
        name: node.name.clone(),
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

fn value_info(binding: &TensorBinding) -> ValueInfoProto {
    let dim = binding
        .shape
        .iter()
        .map(|d| Dimension {
            value: Some(match d {
                Dim::Batch => dimension::Value::DimParam(BATCH_DIM_PARAM.to_string()),
                Dim::Fixed(n) => dimension::Value::DimValue(*n as i64),
            }),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: binding.name.clone(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: data_type(binding.dtype) as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        ..Default::default()
    }
}

fn data_type(dtype: DType) -> DataType {
    match dtype {
        DType::F32 => DataType::Float,
        DType::I32 => DataType::Int32,
    }
}

fn int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        i: value,
        r#type: AttributeType::Int as i32,
        ..Default::default()
    }
}

fn float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        f: value,
        r#type: AttributeType::Float as i32,
        ..Default::default()
    }
}

fn ints(name: &str, values: &[usize]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        ints: values.iter().map(|&v| v as i64).collect(),
        r#type: AttributeType::Ints as i32,
        ..Default::default()
    }
}

/// Writes `model` as `dir/file_name`, creating `dir` if needed.
///
/// The bytes go to a hidden sibling file first and are renamed into place,
/// so the final name only ever holds a complete artifact.
pub fn write_artifact(model: &ModelProto, dir: &Path, file_name: &str) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(dir).map_err(|source| ExportError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(file_name);
    if path.exists() {
        tracing::warn!("Overwriting existing artifact {}", path.display());
    }

    let staging = dir.join(format!(".{file_name}.partial"));
    let bytes = model.encode_to_vec();
    let written = fs::write(&staging, &bytes).and_then(|()| fs::rename(&staging, &path));
    if let Err(source) = written {
        let _ = fs::remove_file(&staging);
        return Err(ExportError::Write { path, source });
    }

    tracing::info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(path)
}

/// Names, types and shapes an artifact exposes to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactContract {
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
}

impl ArtifactContract {
    pub fn of(graph: &FrozenGraph) -> Self {
        Self {
            inputs: graph.inputs(),
            outputs: graph.outputs(),
        }
    }

    /// Decodes the declared inputs and outputs of an ONNX model.
    pub fn from_model(model: &ModelProto) -> Result<Self, ExportError> {
        let graph = model.graph.as_ref().ok_or(ExportError::MissingGraph)?;
        Ok(Self {
            inputs: graph.input.iter().map(binding).collect::<Result<_, _>>()?,
            outputs: graph.output.iter().map(binding).collect::<Result<_, _>>()?,
        })
    }

    /// Reads and decodes the contract of an artifact file.
    pub fn read(path: &Path) -> Result<Self, ExportError> {
        let bytes = fs::read(path).map_err(|source| ExportError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let model = ModelProto::decode(bytes.as_slice()).map_err(|source| ExportError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_model(&model)
    }

    pub fn input(&self, name: &str) -> Option<&TensorBinding> {
        self.inputs.iter().find(|b| b.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorBinding> {
        self.outputs.iter().find(|b| b.name == name)
    }
}

impl fmt::Display for ArtifactContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self.inputs.iter().map(|b| format!("Input node name: {b}"));
        let outputs = self.outputs.iter().map(|b| format!("Output node name: {b}"));
        let lines: Vec<String> = inputs.chain(outputs).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

fn binding(info: &ValueInfoProto) -> Result<TensorBinding, ExportError> {
    let invalid = |reason: &str| ExportError::InvalidTensor {
        name: info.name.clone(),
        reason: reason.to_string(),
    };

    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
    }) = &info.r#type
    else {
        return Err(invalid("missing tensor type"));
    };

    let dtype = match DataType::try_from(tensor.elem_type) {
        Ok(DataType::Float) => DType::F32,
        Ok(DataType::Int32) => DType::I32,
        _ => return Err(invalid("unsupported element type")),
    };

    let shape = tensor
        .shape
        .as_ref()
        .ok_or_else(|| invalid("missing shape"))?
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(dimension::Value::DimValue(n)) if *n >= 0 => Ok(Dim::Fixed(*n as usize)),
            Some(dimension::Value::DimParam(_)) => Ok(Dim::Batch),
            _ => Err(invalid("unbound dimension")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TensorBinding {
        name: info.name.clone(),
        dtype,
        shape,
    })
}
