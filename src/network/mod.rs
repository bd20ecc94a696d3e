pub mod activation;
mod dual_head;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    data::{BoardShape, EncodedBatch},
    error::ConfigError,
    trainer::settings::Hparams,
};

pub use dual_head::DualHeadNet;

/// Which form of cross-entropy the policy head is trained against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossMode {
    /// Against the single best move (argmax of the target).
    Sparse,
    /// Against the full target distribution.
    Dense,
}

/// What a training step minimises: `regime_sign * policy_ce + (v - z)^2 + decay`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Objective {
    pub loss_mode: LossMode,
    pub regime_sign: f32,
}

impl Default for Objective {
    fn default() -> Self {
        Self { loss_mode: LossMode::Sparse, regime_sign: 1.0 }
    }
}

/// Per-example policy distributions (`batch * classes`) and values (`batch`).
#[derive(Clone, Debug, PartialEq)]
pub struct Outputs {
    pub policy: Vec<f32>,
    pub value: Vec<f32>,
}

pub struct Gradients {
    pub grads: Vec<f32>,
    pub outputs: Outputs,
    pub loss: f32,
}

/// A trainable policy/value predictor with a flat parameter buffer.
///
/// Implementations own the layout of their weights; callers only see the buffer, the
/// forward pass and mean gradients over a batch.
pub trait Network: fmt::Display + Send {
    fn kind(&self) -> ModelKind;

    fn shape(&self) -> BoardShape;

    fn weights(&self) -> &[f32];

    fn weights_mut(&mut self) -> &mut [f32];

    fn size(&self) -> usize {
        self.weights().len()
    }

    /// Softmax temperature applied to the policy logits.
    fn temperature(&self) -> f32;

    /// Forward pass over `inputs.len() / shape().input_size()` encoded positions.
    fn forward(&self, inputs: &[f32]) -> Outputs;

    /// Total loss of `outputs` against the targets of `batch`, including regularisation.
    fn loss(&self, outputs: &Outputs, batch: &EncodedBatch, objective: Objective) -> f32;

    /// Forward and backward pass, producing gradients of the mean loss.
    fn gradients(&self, batch: &EncodedBatch, objective: Objective) -> Gradients;
}

/// The closed set of predictor architectures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Residual tower with leaky ReLU activations.
    Relu,
    /// Residual tower with ELU activations.
    Elu,
}

impl ModelKind {
    pub fn build(self, shape: BoardShape, hparams: &Hparams) -> Box<dyn Network> {
        let net = DualHeadNet::new(self, shape, hparams);
        log::info!("Built {self} model {net} with {} parameters", net.size());
        Box::new(net)
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" | "resnet" => Ok(Self::Relu),
            "elu" | "resnet_elu" => Ok(Self::Elu),
            _ => Err(ConfigError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relu => write!(f, "relu"),
            Self::Elu => write!(f, "elu"),
        }
    }
}

/// Index of the largest value, first one on ties.
pub fn argmax(xs: &[f32]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate() {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

/// Fraction of examples whose top predicted move is the top target move.
pub fn move_accuracy(policy: &[f32], targets: &[f32], classes: usize) -> f32 {
    let total = targets.len() / classes;
    if total == 0 {
        return 0.0;
    }

    let hits = policy
        .chunks_exact(classes)
        .zip(targets.chunks_exact(classes))
        .filter(|(p, t)| argmax(p) == argmax(t))
        .count();

    hits as f32 / total as f32
}

/// Fraction of examples where the predicted value has the sign of the outcome.
pub fn outcome_accuracy(values: &[f32], outcomes: &[f32]) -> f32 {
    if outcomes.is_empty() {
        return 0.0;
    }

    let hits = values.iter().zip(outcomes).filter(|(&v, &z)| (v > 0.0) == (z > 0.0)).count();
    hits as f32 / outcomes.len() as f32
}
