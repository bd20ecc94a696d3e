use std::{fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, error::PersistenceError, util};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimiserKind {
    #[serde(rename = "sgd")]
    Sgd,
    #[default]
    #[serde(rename = "mom")]
    Momentum,
    #[serde(rename = "adam")]
    Adam,
}

impl FromStr for OptimiserKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "mom" | "momentum" => Ok(Self::Momentum),
            "adam" => Ok(Self::Adam),
            _ => Err(ConfigError::UnknownOptimiser(s.to_string())),
        }
    }
}

impl fmt::Display for OptimiserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => write!(f, "sgd"),
            Self::Momentum => write!(f, "mom"),
            Self::Adam => write!(f, "adam"),
        }
    }
}

/// Update rule plus its per-parameter state.
///
/// `momentum` holds the velocity buffer for [`OptimiserKind::Momentum`] and the first moment
/// for [`OptimiserKind::Adam`]; `velocity` is Adam's second moment. Plain SGD keeps both
/// zeroed so every kind checkpoints the same files.
pub struct Optimiser {
    kind: OptimiserKind,
    beta: f32,
    momentum: Vec<f32>,
    velocity: Vec<f32>,
    updates: u64,
}

impl Optimiser {
    pub fn new(kind: OptimiserKind, size: usize, beta: f32) -> Self {
        Self { kind, beta, momentum: vec![0.0; size], velocity: vec![0.0; size], updates: 0 }
    }

    pub fn kind(&self) -> OptimiserKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.momentum.len()
    }

    pub fn update(&mut self, weights: &mut [f32], grads: &[f32], lr: f32) {
        assert_eq!(weights.len(), self.size(), "Optimiser state does not match network size!");
        assert_eq!(grads.len(), self.size(), "Gradient does not match network size!");

        self.updates += 1;

        match self.kind {
            OptimiserKind::Sgd => {
                for (w, g) in weights.iter_mut().zip(grads) {
                    *w -= lr * g;
                }
            }
            OptimiserKind::Momentum => {
                for ((w, m), g) in weights.iter_mut().zip(self.momentum.iter_mut()).zip(grads) {
                    *m = self.beta * *m + g;
                    *w -= lr * *m;
                }
            }
            OptimiserKind::Adam => {
                let t = self.updates.min(i32::MAX as u64) as i32;
                let c1 = 1.0 - ADAM_BETA1.powi(t);
                let c2 = 1.0 - ADAM_BETA2.powi(t);

                for (((w, m), v), g) in
                    weights.iter_mut().zip(self.momentum.iter_mut()).zip(self.velocity.iter_mut()).zip(grads)
                {
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;

                    let m_hat = *m / c1;
                    let v_hat = *v / c2;
                    *w -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
                }
            }
        }
    }

    /// Writes `momentum.bin` and `velocity.bin` into `path`, creating it if needed.
    pub fn write_to_checkpoint(&self, path: &Path) -> Result<(), PersistenceError> {
        fs::create_dir_all(path)?;
        util::write_f32s(&self.momentum, path.join("momentum.bin"))?;
        util::write_f32s(&self.velocity, path.join("velocity.bin"))
    }

    /// Restores state written by [`Optimiser::write_to_checkpoint`]. `updates` is the number
    /// of optimisation steps the state has seen, used for Adam's bias correction.
    pub fn load_from_checkpoint(&mut self, path: &Path, updates: u64) -> Result<(), PersistenceError> {
        let momentum = util::read_f32s(path.join("momentum.bin"), self.size())?;
        let velocity = util::read_f32s(path.join("velocity.bin"), self.size())?;

        self.momentum = momentum;
        self.velocity = velocity;
        self.updates = updates;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimiser_names() {
        assert_eq!("mom".parse::<OptimiserKind>().unwrap(), OptimiserKind::Momentum);
        assert_eq!("adam".parse::<OptimiserKind>().unwrap(), OptimiserKind::Adam);
        assert_eq!(OptimiserKind::default().to_string(), "mom");
        assert!(matches!("rmsprop".parse::<OptimiserKind>(), Err(ConfigError::UnknownOptimiser(_))));
    }

    #[test]
    fn momentum_accumulates() {
        let mut opt = Optimiser::new(OptimiserKind::Momentum, 1, 0.9);
        let mut w = [1.0];

        opt.update(&mut w, &[1.0], 0.1);
        assert!((w[0] - 0.9).abs() < 1e-6);

        opt.update(&mut w, &[1.0], 0.1);
        assert!((w[0] - 0.71).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let mut opt = Optimiser::new(OptimiserKind::Adam, 2, 0.9);
        let mut w = [0.0, 0.0];

        opt.update(&mut w, &[4.0, -0.01], 0.01);
        assert!((w[0] + 0.01).abs() < 1e-5);
        assert!((w[1] - 0.01).abs() < 1e-5);
    }

    #[test]
    fn state_survives_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = Optimiser::new(OptimiserKind::Adam, 3, 0.9);
        let mut w = [0.5, -0.5, 0.0];
        opt.update(&mut w, &[0.1, 0.2, 0.3], 0.01);
        opt.write_to_checkpoint(dir.path()).unwrap();

        let mut restored = Optimiser::new(OptimiserKind::Adam, 3, 0.9);
        restored.load_from_checkpoint(dir.path(), 1).unwrap();

        let mut a = w;
        let mut b = w;
        opt.update(&mut a, &[0.3, 0.2, 0.1], 0.01);
        restored.update(&mut b, &[0.3, 0.2, 0.1], 0.01);
        assert_eq!(a, b);
    }
}
