use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use zimage_core::config::ConfigFile;
use zimage_core::paths::PathOverrides;
use zimage_core::testing::{
    empty_safetensors, precision_colour, safetensors_revision, MockEvent, MockLoader,
};
use zimage_core::{
    AppPaths, Config, Device, DeviceMap, EngineStatus, Error, FeatureFlags, GenerationRequest,
    HardwareProfile, HistoryQuery, LoraRequest, Precision, Worker,
};

struct Fixture {
    _dir: TempDir,
    loader: MockLoader,
    worker: Worker,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let overrides = PathOverrides {
        data_dir: Some(dir.path().join("data")),
        output_dir: None,
    };
    let paths =
        AppPaths::resolve(&dir.path().join("cfg"), &overrides, &ConfigFile::default()).unwrap();
    let config = Config {
        paths,
        device_map: DeviceMap::ForceCpu,
        features: FeatureFlags::default(),
    };
    let loader = MockLoader::new();
    let profile = HardwareProfile::from_parts(Device::Cpu, 32.0, None);
    let worker = Worker::open(&config, profile, Arc::new(loader.clone()))
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        loader,
        worker,
    }
}

fn request(prompt: &str, size: u32, precision: &str) -> GenerationRequest {
    GenerationRequest {
        width: size,
        height: size,
        steps: 2,
        precision: precision.to_string(),
        ..GenerationRequest::new(prompt)
    }
}

async fn history_total(worker: &Worker) -> i64 {
    worker
        .history()
        .list(&HistoryQuery::default())
        .await
        .unwrap()
        .1
}

#[tokio::test]
async fn test_dimensions_are_adjusted_and_recorded() {
    let f = fixture().await;
    let result = f.worker.generate(request("a cat", 100, "q8")).await.unwrap();

    assert_eq!((result.width, result.height), (96, 96));
    assert!(result.seed <= zimage_core::worker::MAX_GENERATED_SEED);
    assert_eq!(result.precision, Precision::Q8);
    assert_eq!(result.model_id, "city96/FLUX.1-schnell-gguf");
    assert!(result.generation_time >= 0.0);
    assert!(result.file_size_kb > 0.0);

    let img = image::open(&result.output_path).unwrap();
    assert_eq!((img.width(), img.height()), (96, 96));

    let entry = f.worker.history().get(result.history_id.unwrap()).await.unwrap();
    assert_eq!((entry.width, entry.height), (96, 96));
    assert_eq!(entry.seed, Some(result.seed as i64));
    assert_eq!(entry.filename, result.filename);
}

#[tokio::test]
async fn test_explicit_seed_is_echoed() {
    let f = fixture().await;
    let mut req = request("a cat", 64, "q4");
    req.seed = Some(424242);
    let result = f.worker.generate(req).await.unwrap();
    assert_eq!(result.seed, 424242);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_precisions_never_mix() {
    let f = fixture().await;
    f.loader.set_run_delay(Duration::from_millis(50));

    let mut handles = Vec::new();
    for (i, precision) in ["q8", "q4", "q8", "full"].into_iter().enumerate() {
        let worker = f.worker.clone();
        handles.push(tokio::spawn(async move {
            worker
                .generate(request(&format!("job {i}"), 32, precision))
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        let img = image::open(&result.output_path).unwrap().to_rgb8();
        assert_eq!(*img.get_pixel(0, 0), precision_colour(result.precision));
    }
    assert_eq!(f.loader.max_concurrent_runs(), 1);
    assert_eq!(history_total(&f.worker).await, 4);
}

#[tokio::test]
async fn test_lora_snapshot_survives_lora_deletion() {
    let f = fixture().await;
    let lora = f
        .worker
        .loras()
        .install("style.safetensors", Some("Style"), None, &empty_safetensors())
        .await
        .unwrap();

    let mut req = request("styled", 64, "q8");
    req.loras = vec![LoraRequest {
        filename: "style.safetensors".to_string(),
        strength: 0.8,
    }];
    let result = f.worker.generate(req).await.unwrap();
    f.worker.loras().delete(lora.id).await.unwrap();

    let entry = f.worker.history().get(result.history_id.unwrap()).await.unwrap();
    assert_eq!(entry.loras.len(), 1);
    assert_eq!(entry.loras[0].filename, "style.safetensors");
    assert_eq!(entry.loras[0].display_name, "Style");
    assert_eq!(entry.loras[0].strength, 0.8);
}

#[tokio::test]
async fn test_reinstalled_lora_is_reattached() {
    let f = fixture().await;
    let loras = f.worker.loras();
    loras
        .install("style.safetensors", None, None, &safetensors_revision("1"))
        .await
        .unwrap();

    let styled = || {
        let mut req = request("styled", 64, "q8");
        req.loras = vec![LoraRequest {
            filename: "style.safetensors".to_string(),
            strength: 1.0,
        }];
        req
    };
    f.worker.generate(styled()).await.unwrap();
    f.worker.generate(styled()).await.unwrap();

    loras
        .install("style.safetensors", None, None, &safetensors_revision("2"))
        .await
        .unwrap();
    f.worker.generate(styled()).await.unwrap();

    let attaches = f
        .loader
        .events()
        .into_iter()
        .filter(|e| matches!(e, MockEvent::Attach(_)))
        .count();
    assert_eq!(attaches, 2, "{:?}", f.loader.events());
    assert_eq!(f.loader.load_count(), 1);
}

#[tokio::test]
async fn test_failed_inference_writes_nothing() {
    let f = fixture().await;
    f.loader.fail_next_run("kernel launch failed");
    let err = f.worker.generate(request("a cat", 64, "q8")).await.unwrap_err();
    assert!(matches!(err, Error::Generation { .. }));
    assert_eq!(history_total(&f.worker).await, 0);
    let pngs = std::fs::read_dir(f.worker.outputs_dir()).unwrap().count();
    assert_eq!(pngs, 0);
}

#[tokio::test]
async fn test_model_load_failure_recovers_on_next_call() {
    let f = fixture().await;
    f.loader.fail_next_load();
    let err = f.worker.generate(request("a cat", 64, "full")).await.unwrap_err();
    assert!(matches!(err, Error::ModelLoad { .. }));
    assert_eq!(f.worker.engine_status().await, EngineStatus::Unloaded);

    f.worker.generate(request("a cat", 64, "full")).await.unwrap();
    assert_eq!(f.worker.engine_status().await, EngineStatus::Ready);
    assert_eq!(f.loader.load_count(), 1);
}

#[tokio::test]
async fn test_panicking_adapter_is_a_load_error() {
    let f = fixture().await;
    f.worker
        .loras()
        .install("bad.safetensors", None, None, &empty_safetensors())
        .await
        .unwrap();
    let mut req = request("styled", 64, "q8");
    req.loras = vec![LoraRequest {
        filename: "bad.safetensors".to_string(),
        strength: 1.0,
    }];

    f.loader.panic_next_attach();
    let err = f.worker.generate(req).await.unwrap_err();
    assert!(matches!(err, Error::ModelLoad { .. }), "{err}");
    assert_eq!(f.worker.engine_status().await, EngineStatus::Unloaded);

    f.worker.generate(request("plain", 64, "q8")).await.unwrap();
    assert_eq!(f.worker.engine_status().await, EngineStatus::Ready);
}

#[tokio::test]
async fn test_invalid_requests_are_client_errors() {
    let f = fixture().await;
    f.worker
        .loras()
        .install("a.safetensors", None, None, &empty_safetensors())
        .await
        .unwrap();
    let lora = |name: &str| LoraRequest {
        filename: name.to_string(),
        strength: 1.0,
    };

    let mut too_many = request("x", 64, "q8");
    too_many.loras = (0..5).map(|i| lora(&format!("{i}.safetensors"))).collect();
    let mut duplicate = request("x", 64, "q8");
    duplicate.loras = vec![lora("a.safetensors"), lora("a.safetensors")];
    let mut unknown = request("x", 64, "q8");
    unknown.loras = vec![lora("missing.safetensors")];
    let mut no_steps = request("x", 64, "q8");
    no_steps.steps = 0;

    for req in [
        request("   ", 64, "q8"),
        request("x", 64, "q9"),
        too_many,
        duplicate,
        unknown,
        no_steps,
    ] {
        let err = f.worker.generate(req).await.unwrap_err();
        assert!(err.is_client_error(), "{err}");
    }
    assert_eq!(f.loader.load_count(), 0);
    assert!(matches!(
        f.worker.generate(request("x", 64, "q9")).await,
        Err(Error::UnknownPrecision(_))
    ));
}

#[tokio::test]
async fn test_opting_out_of_history() {
    let f = fixture().await;
    let mut req = request("private", 64, "q8");
    req.record_history = false;
    let result = f.worker.generate(req).await.unwrap();
    assert_eq!(result.history_id, None);
    assert!(result.output_path.exists());
    assert_eq!(history_total(&f.worker).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_caller_does_not_cancel_job() {
    let f = fixture().await;
    f.loader.set_run_delay(Duration::from_millis(200));

    let attempt = tokio::time::timeout(
        Duration::from_millis(20),
        f.worker.generate(request("slow", 32, "q8")),
    )
    .await;
    assert!(attempt.is_err());

    for _ in 0..100 {
        if history_total(&f.worker).await == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("abandoned job never recorded its history entry");
}

#[tokio::test]
async fn test_history_delete_removes_image() {
    let f = fixture().await;
    let result = f.worker.generate(request("a cat", 64, "q8")).await.unwrap();
    assert!(result.output_path.exists());

    f.worker.history().delete(result.history_id.unwrap()).await.unwrap();
    assert!(!result.output_path.exists());
    assert_eq!(history_total(&f.worker).await, 0);
}
