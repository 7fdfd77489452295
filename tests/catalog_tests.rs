//! Model directory scanning as seen through the orchestrator.

mod common;

use airlock::catalog::{scan, ScanOptions, UNKNOWN_QUANTIZATION};

use common::{config_for, orchestrator, write_model};

#[tokio::test]
async fn test_missing_directory_is_created_empty() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("models");
    assert!(!dir.exists());

    let (orch, _recorder) = orchestrator(config_for(&dir));
    let models = orch.list_models().await.unwrap();

    assert!(models.is_empty());
    assert!(dir.is_dir());
}

#[tokio::test]
async fn test_only_model_files_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("modelA.gguf"), vec![0u8; 4096]).unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"not a model").unwrap();

    let (orch, _recorder) = orchestrator(config_for(dir.path()));
    let models = orch.list_models().await.unwrap();

    assert_eq!(models.len(), 1);
    let model = &models[0];
    assert_eq!(model.name, "modelA");
    assert_eq!(model.size_bytes, 4096);
    assert_eq!(model.size_gb, 0.0);
    assert_eq!(model.size, "0.00 GB");
    assert_eq!(model.quantization, UNKNOWN_QUANTIZATION);
    assert!(model.path.is_absolute());
    assert_eq!(model.id, model.path.to_string_lossy());
}

#[test]
fn test_extension_match_ignores_case_and_name_carries_quantization() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("mistral-7b_instruct.Q4_K_M.GGUF"), b"GGUF").unwrap();

    let models = scan(dir.path(), &ScanOptions::default()).unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "mistral 7b instruct.Q4 K M");
    assert_eq!(models[0].quantization, "Q4_K_M");
}

#[tokio::test]
async fn test_file_in_place_of_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("models");
    std::fs::write(&file, b"oops").unwrap();

    let (orch, _recorder) = orchestrator(config_for(&file));
    let err = orch.list_models().await.unwrap_err();
    assert_eq!(err.kind(), airlock::ErrorKind::Catalog);
}

#[tokio::test]
async fn test_status_reports_catalog_size() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path(), "a.gguf");
    write_model(dir.path(), "b.gguf");

    let (orch, _recorder) = orchestrator(config_for(dir.path()));
    assert_eq!(orch.status().catalog_models, None);
    orch.list_models().await.unwrap();
    assert_eq!(orch.status().catalog_models, Some(2));
}
