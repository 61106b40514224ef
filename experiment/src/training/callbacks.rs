//! Per-epoch training policies driven by validation loss.
//!
//! - [`ReduceLrOnPlateau`]: shrink the learning rate when progress stalls
//! - [`EarlyStopping`]: stop when progress stalls for longer
//! - [`Checkpointer`]: persist the variables whenever validation loss improves
//! - [`WeightSnapshot`]: in-memory copy of the variables for restoring the best epoch

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use memesense_core::config::{EarlyStoppingConfig, PlateauConfig};
use memesense_core::{MemeSenseError, Result};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Learning-rate schedule
// ---------------------------------------------------------------------------

/// Multiply the learning rate by `factor` after `patience` epochs without an
/// improvement of at least `min_delta`, then wait `cooldown` epochs before
/// counting again.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    best: f64,
    wait: usize,
    cooldown_left: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: &PlateauConfig) -> Self {
        Self {
            config: config.clone(),
            best: f64::INFINITY,
            wait: 0,
            cooldown_left: 0,
        }
    }

    /// Record one epoch's validation loss. Returns the new learning rate when
    /// a reduction happens.
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.wait = 0;
        }

        if val_loss < self.best - self.config.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        if self.cooldown_left > 0 {
            return None;
        }

        self.wait += 1;
        if self.wait < self.config.patience {
            return None;
        }
        self.wait = 0;
        if current_lr <= self.config.min_lr {
            return None;
        }
        let new_lr = (current_lr * self.config.factor).max(self.config.min_lr);
        self.cooldown_left = self.config.cooldown;
        info!(from = current_lr, to = new_lr, "Reducing learning rate on plateau");
        Some(new_lr)
    }
}

// ---------------------------------------------------------------------------
// Early stopping
// ---------------------------------------------------------------------------

/// What [`EarlyStopping::update`] concluded for an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStoppingDecision {
    /// New best validation loss.
    Improved,
    /// No improvement, patience not yet exhausted.
    Continue,
    /// Patience exhausted.
    Stop,
}

/// Stop after `patience` epochs without an improvement greater than `min_delta`.
/// A loss counts as improved only when it is below `best - min_delta`.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            min_delta: config.min_delta,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn update(&mut self, epoch: usize, val_loss: f64) -> EarlyStoppingDecision {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return EarlyStoppingDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            EarlyStoppingDecision::Stop
        } else {
            EarlyStoppingDecision::Continue
        }
    }

    /// Epoch of the best validation loss so far.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_loss(&self) -> f64 {
        self.best
    }
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Save the variable map whenever validation loss reaches a new minimum.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    best: f64,
}

impl Checkpointer {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            best: f64::INFINITY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save when `val_loss` improves on every earlier call. Returns whether a
    /// checkpoint was written.
    pub fn observe(&mut self, varmap: &VarMap, val_loss: f64) -> Result<bool> {
        if val_loss >= self.best {
            return Ok(false);
        }
        self.best = val_loss;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        varmap.save(&self.path).map_err(|e| {
            MemeSenseError::Training(format!(
                "Failed to save checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), val_loss, "Saved checkpoint");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Weight snapshots
// ---------------------------------------------------------------------------

/// Deep copy of every variable in a [`VarMap`].
#[derive(Debug, Clone)]
pub struct WeightSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl WeightSnapshot {
    pub fn capture(varmap: &VarMap) -> Result<Self> {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| MemeSenseError::Training("variable map lock poisoned".to_string()))?;
        let mut tensors = HashMap::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            let copy = var
                .as_tensor()
                .copy()
                .map_err(|e| MemeSenseError::Training(format!("Failed to copy '{name}': {e}")))?;
            tensors.insert(name.clone(), copy);
        }
        Ok(Self { tensors })
    }

    /// Write the snapshot back into `varmap`.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| MemeSenseError::Training("variable map lock poisoned".to_string()))?;
        for (name, var) in vars.iter() {
            let tensor = self.tensors.get(name).ok_or_else(|| {
                MemeSenseError::Training(format!("Snapshot has no variable '{name}'"))
            })?;
            var.set(tensor)
                .map_err(|e| MemeSenseError::Training(format!("Failed to restore '{name}': {e}")))?;
        }
        Ok(())
    }
}
