use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dreambooth_rs::config::ConfigTemplate;
use dreambooth_rs::loss::rectified_flow_loss;
use dreambooth_rs::model::Architecture;
use dreambooth_rs::lora::LoraLayerSelector;
use dreambooth_rs::schedule::{NoiseSchedule, ScheduleKind};
use dreambooth_rs::TrainingConfig;
use candle_core::{Device, Tensor};
use std::io::Write;
use tempfile::NamedTempFile;

// Small JSON config for basic benchmarking
const SMALL_JSON: &str = r#"{
    "model": "dev",
    "seed": 42,
    "steps": 20,
    "quantize": 4,
    "training_loop": { "num_epochs": 100, "batch_size": 1 },
    "optimizer": { "name": "AdamW", "learning_rate": 1e-4 },
    "save": { "output_path": "./outputs/dog", "checkpoint_frequency": 20 },
    "lora_layers": {
        "transformer_blocks": {
            "block_range": { "start": 5, "end": 15 },
            "layer_types": ["attn.to_q", "attn.to_k", "attn.to_v"],
            "lora_rank": 16
        },
        "single_transformer_blocks": {
            "block_range": { "start": 0, "end": 38 },
            "layer_types": ["proj_out", "proj_mlp", "attn.to_q", "attn.to_k", "attn.to_v"],
            "lora_rank": 4
        }
    },
    "examples": {
        "path": "./images",
        "images": [{ "image": "01.jpg", "prompt": "photo of sks dog" }]
    }
}"#;

// Generate a config listing many example images
fn generate_large_json(num_images: usize) -> String {
    let images: Vec<String> = (0..num_images)
        .map(|i| format!(r#"{{ "image": "{i:04}.jpg", "prompt": "photo of sks dog, pose {i}" }}"#))
        .collect();
    SMALL_JSON.replace(
        r#"[{ "image": "01.jpg", "prompt": "photo of sks dog" }]"#,
        &format!("[{}]", images.join(",\n")),
    )
}

fn bench_config_from_json(c: &mut Criterion) {
    c.bench_function("config_from_json_small", |b| {
        b.iter(|| {
            let config = black_box(TrainingConfig::from_json(SMALL_JSON, ".").unwrap());
            black_box(config);
        });
    });
}

fn bench_config_from_json_large(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_from_json_large");

    for size in [100, 500, 1000].iter() {
        let large_json = generate_large_json(*size);
        group.bench_with_input(format!("images_{}", size), size, |b, _| {
            b.iter(|| {
                let config = black_box(TrainingConfig::from_json(&large_json, ".").unwrap());
                black_box(config);
            });
        });
    }

    group.finish();
}

fn bench_config_validate(c: &mut Criterion) {
    c.bench_function("config_validate", |b| {
        let config = TrainingConfig::from_json(SMALL_JSON, ".").unwrap();
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result).unwrap();
        });
    });
}

fn bench_config_validate_invalid(c: &mut Criterion) {
    c.bench_function("config_validate_invalid", |b| {
        let mut config = TrainingConfig::from_json(SMALL_JSON, ".").unwrap();
        config.steps = 0; // Make invalid
        config.width = 500; // Make invalid
        config.examples.images.clear(); // Make invalid

        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result.is_err());
        });
    });
}

fn bench_templates(c: &mut Criterion) {
    c.bench_function("templates", |b| {
        b.iter(|| {
            for template in ConfigTemplate::ALL {
                let config = black_box(TrainingConfig::from_preset(template.name()).unwrap());
                black_box(config);
            }
        });
    });
}

fn bench_plan_adapters(c: &mut Criterion) {
    c.bench_function("plan_adapters", |b| {
        let config = TrainingConfig::from_json(SMALL_JSON, ".").unwrap();
        let architecture = Architecture::flux();
        let selector = LoraLayerSelector::new(&architecture);
        b.iter(|| {
            let planned = black_box(selector.plan(config.lora_layers.specs()).unwrap());
            black_box(planned.len());
        });
    });
}

fn bench_config_file_io(c: &mut Criterion) {
    c.bench_function("config_file_io", |b| {
        let config = TrainingConfig::from_json(SMALL_JSON, ".").unwrap();

        b.iter(|| {
            let mut temp_file = NamedTempFile::new().unwrap();
            let json = serde_json::to_string(&config).unwrap();
            temp_file.write_all(json.as_bytes()).unwrap();
            temp_file.flush().unwrap();

            let loaded = black_box(TrainingConfig::from_file(temp_file.path()).unwrap());
            black_box(loaded);
        });
    });
}

fn bench_schedule(c: &mut Criterion) {
    c.bench_function("shifted_schedule_1000", |b| {
        b.iter(|| {
            let schedule = NoiseSchedule::new(
                black_box(1000),
                ScheduleKind::Shifted {
                    width: 1024,
                    height: 1024,
                },
            )
            .unwrap();
            black_box(schedule.sigma(500));
        });
    });
}

fn bench_loss(c: &mut Criterion) {
    let device = Device::Cpu;
    let shape = (1, 4096, 64);
    let clean = Tensor::randn(0f32, 1.0, shape, &device).unwrap();
    let noise = Tensor::randn(0f32, 1.0, shape, &device).unwrap();
    let predicted = Tensor::randn(0f32, 1.0, shape, &device).unwrap();

    c.bench_function("rectified_flow_loss", |b| {
        b.iter(|| {
            let loss = rectified_flow_loss(&predicted, &clean, &noise).unwrap();
            black_box(loss.to_scalar::<f32>().unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_config_from_json,
    bench_config_from_json_large,
    bench_config_validate,
    bench_config_validate_invalid,
    bench_templates,
    bench_plan_adapters,
    bench_config_file_io,
    bench_schedule,
    bench_loss,
);
criterion_main!(benches);
