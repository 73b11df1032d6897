//! Full-size export of the coarse policy: 64 keeps, no ownership input.

use burn::backend::NdArray;
use keeplord_policy::graph::{ArtifactContract, Dim};
use keeplord_policy::schema::DType;
use keeplord_policy::{ExportPipeline, ExportSettings, PolicyConfig};

type B = NdArray;

#[test]
fn test_coarse_export() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ExportSettings {
        policy: PolicyConfig::coarse(),
        checkpoint: None,
        output_dir: dir.path().join("AI"),
        artifact_name: "coarse.onnx".to_string(),
    };

    let report = ExportPipeline::new(settings)
        .run::<B>(&Default::default())
        .unwrap();

    let contract = ArtifactContract::read(&report.artifact).unwrap();
    assert_eq!(contract, report.contract);

    let inputs: Vec<&str> = contract.inputs.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(inputs, vec!["map_input", "soldier_counts", "archer_counts"]);
    assert!(contract.input("keep_ownership").is_none());
    assert!(contract.inputs.iter().all(|b| b.dtype == DType::F32));

    let source = contract.output("source_keep").unwrap();
    let target = contract.output("target_keep").unwrap();
    assert_eq!(source.shape, vec![Dim::Batch, Dim::Fixed(64)]);
    assert_eq!(target.shape, vec![Dim::Batch, Dim::Fixed(64)]);
    assert_eq!(contract.output("soldier_percent").unwrap().width(), Some(4));
    assert_eq!(contract.output("archer_percent").unwrap().width(), Some(4));
}
