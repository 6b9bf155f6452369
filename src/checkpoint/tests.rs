use super::*;
use crate::config::ModelConfig;
use proptest::prelude::*;

fn tiny_config(layers: usize) -> ModelConfig {
    ModelConfig {
        hidden_size: 8,
        intermediate_size: 16,
        num_attention_heads: 2,
        num_key_value_heads: 2,
        num_hidden_layers: layers,
        rope_theta: 10_000.0,
        max_seq_len: 64,
    }
}

/// Dense model with deterministic per-parameter data
fn patterned_model(layers: usize) -> Model {
    let mut model = Model::dense(&tiny_config(layers)).expect("model");
    for (i, (_, tensor)) in model.named_parameters_mut().into_iter().enumerate() {
        let n = tensor.byte_len() / 4;
        #[allow(clippy::cast_precision_loss)]
        let values: Vec<f32> = (0..n).map(|j| (i * 1000 + j) as f32 * 0.01).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        tensor.materialize(&bytes).expect("fill");
    }
    model
}

fn owned_tensors(sizes: &[usize]) -> Vec<(String, Tensor)> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            (
                format!("t{i}"),
                Tensor::from_f32(vec![n], vec![0.5; n]).expect("tensor"),
            )
        })
        .collect()
}

fn as_refs(owned: &[(String, Tensor)]) -> Vec<(String, &Tensor)> {
    owned.iter().map(|(n, t)| (n.clone(), t)).collect()
}

#[test]
fn test_plan_shards_greedy_binning() {
    // 4-byte floats: sizes are 40, 40, 40 bytes against a 100-byte budget
    let owned = owned_tensors(&[10, 10, 10]);
    let plans = plan_shards(&as_refs(&owned), 100);
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].names, vec!["t0", "t1"]);
    assert_eq!(plans[1].names, vec!["t2"]);
    assert_eq!(plans[0].bytes, 80);
}

#[test]
fn test_plan_shards_oversized_parameter_gets_own_shard() {
    let owned = owned_tensors(&[2, 100, 2]);
    let plans = plan_shards(&as_refs(&owned), 64);
    assert_eq!(plans.len(), 3);
    assert_eq!(plans[1].names, vec!["t1"]);
    assert_eq!(plans[1].bytes, 400);
}

#[test]
fn test_plan_shards_empty_input() {
    assert!(plan_shards(&[], 1024).is_empty());
}

#[test]
fn test_shard_filename_convention() {
    assert_eq!(shard_filename(1, 1), "model.safetensors");
    assert_eq!(shard_filename(1, 4), "model-00001-of-00004.safetensors");
    assert_eq!(shard_filename(4, 4), "model-00004-of-00004.safetensors");
}

#[test]
fn test_save_single_shard_writes_no_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(1);

    let report = save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect("save");
    assert_eq!(report.shard_files, vec![WEIGHTS_NAME.to_string()]);
    assert!(!report.manifest_written);
    assert_eq!(report.total_size, model.parameter_bytes() as u64);
    assert!(dir.path().join(WEIGHTS_NAME).exists());
    assert!(!dir.path().join(INDEX_NAME).exists());
}

#[test]
fn test_save_multi_shard_writes_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(2);

    // One layer is 2560 bytes; force one shard per layer-ish granularity
    let report = save_checkpoint(&model, dir.path(), 1024).expect("save");
    assert!(report.shard_files.len() > 1);
    assert!(report.manifest_written);

    let manifest = read_manifest(dir.path())
        .expect("read")
        .expect("manifest present");
    assert_eq!(manifest.metadata.total_size, model.parameter_bytes() as u64);
    assert_eq!(manifest.weight_map.len(), model.named_parameters().len());
    for filename in manifest.weight_map.values() {
        assert!(dir.path().join(filename).exists());
    }
}

#[test]
fn test_save_exact_shard_count_at_layer_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    // One layer's parameters total exactly 2560 bytes (4 x 256 + 3 x 512),
    // so a 2560-byte budget bins each of the 4 layers into its own shard
    let model = patterned_model(4);
    assert_eq!(model.parameter_bytes(), 4 * 2560);

    let report = save_checkpoint(&model, dir.path(), 2560).expect("save");
    assert_eq!(report.shard_files.len(), 4);
    assert!(report.manifest_written);
    assert_eq!(
        report.shard_files,
        vec![
            "model-00001-of-00004.safetensors",
            "model-00002-of-00004.safetensors",
            "model-00003-of-00004.safetensors",
            "model-00004-of-00004.safetensors",
        ]
    );
    for filename in &report.shard_files {
        assert!(dir.path().join(filename).exists(), "{filename} missing");
    }

    let manifest = read_manifest(dir.path()).expect("read").expect("manifest");
    assert_eq!(manifest.metadata.total_size, 4 * 2560);
    // Each shard holds exactly one layer's parameters
    for (name, filename) in &manifest.weight_map {
        let layer: usize = name
            .strip_prefix("model.layers.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|idx| idx.parse().ok())
            .expect("layer index");
        assert_eq!(*filename, shard_filename(layer + 1, 4), "{name}");
    }
}

#[test]
fn test_save_rejects_unmaterialized_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = Model::dense_empty(&tiny_config(1)).expect("model");
    let err = save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect_err("must fail");
    assert!(matches!(err, EmpacarError::InvalidShape { .. }));
}

#[test]
fn test_resave_removes_stale_single_file_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(1);

    save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect("single save");
    assert!(dir.path().join(WEIGHTS_NAME).exists());

    save_checkpoint(&model, dir.path(), 1024).expect("sharded save");
    assert!(!dir.path().join(WEIGHTS_NAME).exists());
    assert!(dir.path().join(INDEX_NAME).exists());
}

#[test]
fn test_round_trip_single_shard_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let saved = patterned_model(2);
    save_checkpoint(&saved, dir.path(), DEFAULT_SHARD_BYTES).expect("save");

    let mut loaded = Model::dense_empty(&tiny_config(2)).expect("model");
    load_checkpoint(&mut loaded, dir.path()).expect("load");
    assert!(loaded.is_fully_materialized());

    for ((name_a, a), (name_b, b)) in saved
        .named_parameters()
        .iter()
        .zip(loaded.named_parameters().iter())
    {
        assert_eq!(name_a, name_b);
        assert_eq!(
            a.to_le_bytes().expect("bytes"),
            b.to_le_bytes().expect("bytes"),
            "parameter '{name_a}' differs after round trip"
        );
    }
}

#[test]
fn test_round_trip_sharded_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let saved = patterned_model(3);
    let report = save_checkpoint(&saved, dir.path(), 2048).expect("save");
    assert!(report.shard_files.len() > 1);

    let mut loaded = Model::dense_empty(&tiny_config(3)).expect("model");
    load_checkpoint(&mut loaded, dir.path()).expect("load");

    let a: Vec<Vec<u8>> = saved
        .named_parameters()
        .iter()
        .map(|(_, t)| t.to_le_bytes().expect("bytes"))
        .collect();
    let b: Vec<Vec<u8>> = loaded
        .named_parameters()
        .iter()
        .map(|(_, t)| t.to_le_bytes().expect("bytes"))
        .collect();
    assert_eq!(a, b);
}

#[test]
fn test_load_missing_checkpoint_is_shard_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut model = Model::dense_empty(&tiny_config(1)).expect("model");
    let err = load_checkpoint(&mut model, dir.path()).expect_err("must fail");
    assert!(matches!(err, EmpacarError::ShardMissing { .. }));
}

#[test]
fn test_load_manifest_referencing_absent_shard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(2);
    save_checkpoint(&model, dir.path(), 1024).expect("save");

    let manifest = read_manifest(dir.path()).expect("read").expect("manifest");
    let victim = manifest.weight_map.values().next().expect("shard").clone();
    std::fs::remove_file(dir.path().join(&victim)).expect("remove");

    let mut loaded = Model::dense_empty(&tiny_config(2)).expect("model");
    let err = load_checkpoint(&mut loaded, dir.path()).expect_err("must fail");
    match err {
        EmpacarError::ShardMissing { filename } => assert_eq!(filename, victim),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_load_shape_mismatch_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(1);
    save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect("save");

    // Same topology names, different MLP width
    let mut wider = tiny_config(1);
    wider.intermediate_size = 24;
    let mut loaded = Model::dense_empty(&wider).expect("model");
    let err = load_checkpoint(&mut loaded, dir.path()).expect_err("must fail");
    assert!(matches!(err, EmpacarError::ParameterShapeMismatch { .. }));
}

#[test]
fn test_load_missing_parameter_is_format_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(1);
    save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect("save");

    // A two-layer model expects parameters the one-layer checkpoint lacks
    let mut loaded = Model::dense_empty(&tiny_config(2)).expect("model");
    let err = load_checkpoint(&mut loaded, dir.path()).expect_err("must fail");
    assert!(matches!(err, EmpacarError::FormatError { .. }));
}

#[test]
fn test_shard_reader_rejects_truncated_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("model.safetensors");
    std::fs::write(&path, [1, 2, 3]).expect("write");
    let err = ShardReader::open(&path).expect_err("must fail");
    assert!(matches!(err, EmpacarError::FormatError { .. }));
}

#[test]
fn test_shard_reader_rejects_lying_header_length() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("model.safetensors");
    let mut bytes = 1_000_000u64.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"{}");
    std::fs::write(&path, bytes).expect("write");
    let err = ShardReader::open(&path).expect_err("must fail");
    assert!(matches!(err, EmpacarError::FormatError { .. }));
}

#[test]
fn test_shard_reader_exposes_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = patterned_model(1);
    save_checkpoint(&model, dir.path(), DEFAULT_SHARD_BYTES).expect("save");

    let reader = ShardReader::open(&dir.path().join(WEIGHTS_NAME)).expect("open");
    assert_eq!(reader.tensor_count(), model.named_parameters().len());
    let info = reader
        .info("model.layers.0.self_attn.q_proj.weight")
        .expect("info");
    assert_eq!(info.shape, vec![8, 8]);
    assert_eq!(info.dtype, Dtype::F32);
    assert!(reader.info("model.layers.9.mlp.up_proj.weight").is_none());
    assert!(matches!(
        reader.tensor_bytes("nope"),
        Err(EmpacarError::NotFound { .. })
    ));
}

proptest! {
    #[test]
    fn prop_plan_shards_respects_budget(
        sizes in proptest::collection::vec(1usize..64, 1..24),
        budget in 16u64..512,
    ) {
        let owned = owned_tensors(&sizes);
        let refs = as_refs(&owned);
        let plans = plan_shards(&refs, budget);

        // Iteration order is preserved across shards
        let flattened: Vec<&String> = plans.iter().flat_map(|p| p.names.iter()).collect();
        let expected: Vec<&String> = refs.iter().map(|(n, _)| n).collect();
        prop_assert_eq!(flattened, expected);

        for plan in &plans {
            // Only a single oversized parameter may exceed the budget
            prop_assert!(plan.bytes <= budget || plan.names.len() == 1);
            let sum: u64 = plan
                .names
                .iter()
                .map(|n| refs.iter().find(|(rn, _)| rn == n).map_or(0, |(_, t)| t.byte_len() as u64))
                .sum();
            prop_assert_eq!(plan.bytes, sum);
        }
    }
}
