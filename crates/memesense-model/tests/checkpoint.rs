//! Checkpoint save/load and a single optimizer step on the fusion model.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarMap};
use memesense_core::config::{BackboneConfig, ModelConfig, ResNetDepth};
use memesense_model::{trainable_vars, FusionClassifier};

fn tiny_config() -> ModelConfig {
    ModelConfig {
        backbone: BackboneConfig {
            depth: ResNetDepth::R18,
            pretrained: false,
            fine_tune_layers: 0,
            ..BackboneConfig::default()
        },
        image_projection_dim: 8,
        embedding_dim: 6,
        lstm_hidden: 4,
        text_projection_dim: 4,
        fusion_dim: 8,
        ..ModelConfig::default()
    }
}

fn batch() -> (Tensor, Tensor, Tensor) {
    let device = Device::Cpu;
    let images = Tensor::rand(0f32, 1f32, (4, 3, 32, 32), &device).unwrap();
    let tokens = Tensor::new(
        &[[2u32, 3, 4, 0], [5, 1, 0, 0], [6, 7, 8, 9], [3, 3, 0, 0]],
        &device,
    )
    .unwrap();
    let labels = Tensor::new(&[0u32, 1, 2, 4], &device).unwrap();
    (images, tokens, labels)
}

#[test]
fn test_saved_checkpoint_reproduces_logits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("best.safetensors");
    let config = tiny_config();

    let varmap = VarMap::new();
    let model = FusionClassifier::new_trainable(&varmap, &config, 12, &Device::Cpu).unwrap();
    varmap.save(&path).unwrap();

    let restored = FusionClassifier::load(&path, &config, 12, &Device::Cpu).unwrap();
    let (images, tokens, _) = batch();
    let a: Vec<Vec<f32>> = model.forward_logits(&images, &tokens).unwrap().to_vec2().unwrap();
    let b: Vec<Vec<f32>> = restored.forward_logits(&images, &tokens).unwrap().to_vec2().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_checkpoint_with_other_vocabulary_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("best.safetensors");
    let config = tiny_config();

    let varmap = VarMap::new();
    FusionClassifier::new_trainable(&varmap, &config, 12, &Device::Cpu).unwrap();
    varmap.save(&path).unwrap();

    assert!(FusionClassifier::load(&path, &config, 30, &Device::Cpu).is_err());
}

#[test]
fn test_optimizer_step_lowers_loss_and_keeps_frozen_backbone() {
    let config = tiny_config();
    let varmap = VarMap::new();
    let model = FusionClassifier::new_trainable(&varmap, &config, 12, &Device::Cpu).unwrap();
    let (vars, plan) = trainable_vars(&varmap, config.backbone.fine_tune_layers).unwrap();
    assert!(plan.trainable_layers().is_empty());

    let frozen_before: Vec<f32> = varmap.data().lock().unwrap()["image.backbone.conv1.weight"]
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();

    let (images, tokens, labels) = batch();
    let weights = Tensor::ones(5, DType::F32, &Device::Cpu).unwrap();
    let loss_of = |m: &FusionClassifier| -> Tensor {
        let logits = m.forward_t(&images, &tokens, false).unwrap();
        m.loss(&logits, &labels, &weights).unwrap()
    };

    let mut optimizer = candle_nn::AdamW::new(
        vars,
        candle_nn::ParamsAdamW {
            lr: 1e-4,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
    .unwrap();

    let before = loss_of(&model);
    optimizer.backward_step(&before).unwrap();
    let after = loss_of(&model);
    assert!(after.to_scalar::<f32>().unwrap() < before.to_scalar::<f32>().unwrap());

    let frozen_after: Vec<f32> = varmap.data().lock().unwrap()["image.backbone.conv1.weight"]
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(frozen_before, frozen_after);
}
