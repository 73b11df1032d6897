//! The subset of the ONNX protobuf schema the exporter writes and reads,
//! generated from `proto/onnx.proto` at build time.

include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
