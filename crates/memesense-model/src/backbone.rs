//! Pretrained ResNet image backbone.
//!
//! The backbone is the `candle-transformers` ResNet without its classifier
//! head; it ends in global average pooling, so a `[B, 3, H, W]` batch becomes
//! `[B, 512]` (ResNet-18/34) or `[B, 2048]` (ResNet-50/101/152) features.
//! Batch norms always run on their stored statistics.
//!
//! Pretrained weights use the torchvision naming (`conv1.weight`,
//! `layer3.4.bn2.running_var`, ...) and are copied into the variables created
//! under the backbone's prefix in the model's [`VarMap`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Func, VarBuilder, VarMap};
use candle_transformers::models::resnet;
use memesense_core::config::{BackboneConfig, ResNetDepth};
use memesense_core::{MemeSenseError, Result};
use tracing::{debug, info, warn};

const RUNNING_STATS: [&str; 2] = ["running_mean", "running_var"];

/// ResNet feature extractor.
pub struct ImageBackbone {
    net: Func<'static>,
    depth: ResNetDepth,
}

impl ImageBackbone {
    /// Build the architecture, creating its variables through `vb`.
    pub fn new(depth: ResNetDepth, vb: VarBuilder<'static>) -> candle_core::Result<Self> {
        let net = match depth {
            ResNetDepth::R18 => resnet::resnet18_no_final_layer(vb)?,
            ResNetDepth::R34 => resnet::resnet34_no_final_layer(vb)?,
            ResNetDepth::R50 => resnet::resnet50_no_final_layer(vb)?,
            ResNetDepth::R101 => resnet::resnet101_no_final_layer(vb)?,
            ResNetDepth::R152 => resnet::resnet152_no_final_layer(vb)?,
        };
        Ok(Self { net, depth })
    }

    pub fn depth(&self) -> ResNetDepth {
        self.depth
    }

    /// Width of the pooled feature vector.
    pub fn feature_dim(&self) -> usize {
        feature_dim(self.depth)
    }
}

impl Module for ImageBackbone {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.net.forward(xs)
    }
}

/// Width of the pooled features produced by `depth`.
pub fn feature_dim(depth: ResNetDepth) -> usize {
    match depth {
        ResNetDepth::R18 | ResNetDepth::R34 => 512,
        ResNetDepth::R50 | ResNetDepth::R101 | ResNetDepth::R152 => 2048,
    }
}

/// File name of the pretrained weights for `depth` on the hub.
pub fn weights_file_name(depth: ResNetDepth) -> String {
    format!("resnet{}.safetensors", depth.layers())
}

/// Locate pretrained weights: the configured local file, else a hub download.
///
/// Returns `None` when pretrained weights are disabled.
///
/// # Errors
///
/// Returns [`MemeSenseError::Model`] if the local file does not exist or the
/// download fails.
pub fn resolve_weights(config: &BackboneConfig) -> Result<Option<PathBuf>> {
    if !config.pretrained {
        warn!("Pretrained backbone weights disabled, starting from random initialisation");
        return Ok(None);
    }

    if let Some(path) = &config.weights_path {
        if !path.is_file() {
            return Err(MemeSenseError::Model(format!(
                "Backbone weights not found at {}",
                path.display()
            )));
        }
        return Ok(Some(path.clone()));
    }

    let file = weights_file_name(config.depth);
    info!(repo = %config.hub_repo, file = %file, "Fetching backbone weights");
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| MemeSenseError::Model(format!("Failed to initialise hub client: {e}")))?;
    let path = api
        .model(config.hub_repo.clone())
        .get(&file)
        .map_err(|e| {
            MemeSenseError::Model(format!(
                "Failed to download {} from {}: {}",
                file, config.hub_repo, e
            ))
        })?;
    Ok(Some(path))
}

/// Copy pretrained tensors into every variable of `varmap` under `prefix`.
///
/// Tensors in the file without a matching variable (the classifier head) are
/// ignored. Returns the number of variables set.
///
/// # Errors
///
/// Returns [`MemeSenseError::Model`] if the file cannot be read, a variable
/// has no tensor in the file, or a shape differs.
pub fn load_pretrained(
    varmap: &VarMap,
    prefix: &str,
    path: &Path,
    device: &Device,
) -> Result<usize> {
    let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, device)
        .map_err(|e| {
            MemeSenseError::Model(format!(
                "Failed to read backbone weights {}: {}",
                path.display(),
                e
            ))
        })?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| MemeSenseError::Model("variable map lock poisoned".to_string()))?;
    let scope = format!("{prefix}.");
    let mut loaded = 0usize;
    for (name, var) in vars.iter() {
        let Some(local) = name.strip_prefix(&scope) else {
            continue;
        };
        let tensor = tensors.get(local).ok_or_else(|| {
            MemeSenseError::Model(format!(
                "Backbone weights {} have no tensor '{}'",
                path.display(),
                local
            ))
        })?;
        tensor
            .to_dtype(DType::F32)
            .and_then(|t| var.set(&t))
            .map_err(|e| MemeSenseError::Model(format!("Failed to set '{local}': {e}")))?;
        loaded += 1;
    }

    info!(path = %path.display(), variables = loaded, "Loaded pretrained backbone");
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Freezing
// ---------------------------------------------------------------------------

/// Which backbone layers the optimizer may update.
///
/// Parameterized layers (convolutions and batch norms) are put in forward
/// order; the last `fine_tune_layers` of them are trainable and the rest are
/// frozen. Batch-norm running statistics are never trainable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezePlan {
    layers: Vec<String>,
    trainable_from: usize,
}

impl FreezePlan {
    /// Build a plan from backbone variable names (without the backbone prefix).
    pub fn new<'a, I>(var_names: I, fine_tune_layers: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut layers: Vec<String> = var_names
            .into_iter()
            .map(|name| layer_of(name).to_string())
            .collect();
        layers.sort_by(|a, b| layer_order_key(a).cmp(&layer_order_key(b)).then(a.cmp(b)));
        layers.dedup();
        let trainable_from = layers.len().saturating_sub(fine_tune_layers);
        debug!(
            layers = layers.len(),
            frozen = trainable_from,
            "Backbone freeze plan"
        );
        Self {
            layers,
            trainable_from,
        }
    }

    /// Plan over the variables of `varmap` under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`MemeSenseError::Model`] if the variable map lock is poisoned.
    pub fn from_varmap(varmap: &VarMap, prefix: &str, fine_tune_layers: usize) -> Result<Self> {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| MemeSenseError::Model("variable map lock poisoned".to_string()))?;
        let scope = format!("{prefix}.");
        Ok(Self::new(
            vars.keys().filter_map(|k| k.strip_prefix(&scope)),
            fine_tune_layers,
        ))
    }

    /// All parameterized layers in forward order.
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn frozen_layers(&self) -> &[String] {
        &self.layers[..self.trainable_from]
    }

    pub fn trainable_layers(&self) -> &[String] {
        &self.layers[self.trainable_from..]
    }

    /// Whether the backbone variable `var_name` (without prefix) is optimized.
    pub fn is_trainable(&self, var_name: &str) -> bool {
        if is_running_stat(var_name) {
            return false;
        }
        let layer = layer_of(var_name);
        self.trainable_layers().iter().any(|l| l == layer)
    }
}

/// Whether `var_name` is a batch-norm running statistic.
pub fn is_running_stat(var_name: &str) -> bool {
    let leaf = var_name.rsplit('.').next().unwrap_or(var_name);
    RUNNING_STATS.contains(&leaf)
}

fn layer_of(var_name: &str) -> &str {
    var_name.rsplit_once('.').map_or(var_name, |(layer, _)| layer)
}

/// Forward-order key: stem first, then `(stage, block, position in block)`.
fn layer_order_key(layer: &str) -> (usize, usize, usize) {
    match layer {
        "conv1" => return (0, 0, 0),
        "bn1" => return (0, 0, 1),
        _ => {}
    }
    let mut parts = layer.splitn(3, '.');
    let stage = parts
        .next()
        .and_then(|p| p.strip_prefix("layer"))
        .and_then(|p| p.parse::<usize>().ok());
    let block = parts.next().and_then(|p| p.parse::<usize>().ok());
    let position = parts.next().map(|sub| match sub {
        "conv1" => 0,
        "bn1" => 1,
        "conv2" => 2,
        "bn2" => 3,
        "conv3" => 4,
        "bn3" => 5,
        "downsample.0" => 6,
        "downsample.1" => 7,
        _ => 8,
    });
    match (stage, block, position) {
        (Some(s), Some(b), Some(p)) => (s, b, p),
        _ => (usize::MAX, 0, 0),
    }
}
