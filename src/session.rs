use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    data::{BoardShape, EncodedBatch},
    error::{ConfigError, PersistenceError, SessionError},
    network::{self, LossMode, ModelKind, Network, Objective},
    optimiser::{Optimiser, OptimiserKind},
    trainer::settings::Hparams,
    util,
};

const WEIGHTS_FILE: &str = "weights.bin";
const OPTIMISER_DIR: &str = "optimiser_state";
const META_FILE: &str = "meta.json";

/// What a single optimisation step should do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepConfig {
    pub learning_rate: f32,
    pub loss_mode: LossMode,
    /// Flips the sign of the policy term; only meaningful for self-play data.
    pub regime_sign: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub move_accuracy: f32,
    pub outcome_accuracy: f32,
    /// Global gradient norm before clipping.
    pub gradient_norm: f32,
    pub temperature: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EvalMetrics {
    pub loss: f32,
    pub move_accuracy: f32,
    pub outcome_accuracy: f32,
}

/// Move distributions (`batch * classes`) and values (`batch`) for a batch of positions.
#[derive(Clone, Debug, PartialEq)]
pub struct Inference {
    pub policy: Vec<f32>,
    pub value: Vec<f32>,
}

impl Inference {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Move distribution of the `i`th position.
    pub fn policy_for(&self, i: usize) -> &[f32] {
        let classes = self.policy.len() / self.value.len().max(1);
        &self.policy[i * classes..(i + 1) * classes]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    model: ModelKind,
    optimiser: OptimiserKind,
    step: u64,
    size: usize,
    shape: BoardShape,
    hidden: usize,
    residual_units: usize,
}

/// Owns a predictor and its optimiser state.
pub struct ComputeSession {
    net: Box<dyn Network>,
    optimiser: Optimiser,
    batch_size: usize,
    step: u64,
    hparams: Hparams,
}

impl ComputeSession {
    pub fn new(
        model: ModelKind,
        optimiser: OptimiserKind,
        shape: BoardShape,
        batch_size: usize,
        hparams: &Hparams,
    ) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        hparams.validate()?;
        let shape = BoardShape::new(shape.rows, shape.cols, shape.channels, shape.classes)?;
        let net = model.build(shape, hparams);
        let optimiser = Optimiser::new(optimiser, net.size(), hparams.momentum);

        Ok(Self { net, optimiser, batch_size, step: 0, hparams: hparams.clone() })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn shape(&self) -> BoardShape {
        self.net.shape()
    }

    /// Number of optimisation steps applied to these weights.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn network(&self) -> &dyn Network {
        self.net.as_ref()
    }

    pub fn optimiser_kind(&self) -> OptimiserKind {
        self.optimiser.kind()
    }

    pub fn hparams(&self) -> &Hparams {
        &self.hparams
    }

    /// Forward pass over exactly `batch_size` positions whose colour plane is already remapped.
    pub fn infer(&self, features: &[f32]) -> Result<Inference, SessionError> {
        let expected = self.batch_size * self.shape().input_size();
        if features.len() != expected {
            return Err(SessionError::NumericInstability(format!(
                "expected {expected} feature values, got {}",
                features.len()
            )));
        }

        let outputs = self.net.forward(features);
        Ok(Inference { policy: outputs.policy, value: outputs.value })
    }

    fn check(&self, batch: &EncodedBatch) -> Result<(), SessionError> {
        let shape = self.shape();
        let n = batch.len();

        if n != self.batch_size {
            return Err(SessionError::NumericInstability(format!("batch of {n}, session expects {}", self.batch_size)));
        }

        if batch.features().len() != n * shape.input_size() || batch.policy().len() != n * shape.classes {
            return Err(SessionError::NumericInstability(format!("batch does not match shape {shape}")));
        }

        let fields = [("features", batch.features()), ("targets", batch.policy()), ("outcomes", batch.outcomes())];
        for (name, values) in fields {
            if let Some(i) = values.iter().position(|x| !x.is_finite()) {
                return Err(SessionError::NumericInstability(format!("non-finite {name} value at index {i}")));
            }
        }

        Ok(())
    }

    /// One forward, backward and update. Fails without touching weights, optimiser state
    /// or the step counter if the batch or the resulting loss is not finite.
    pub fn train_step(&mut self, batch: &EncodedBatch, config: StepConfig) -> Result<StepMetrics, SessionError> {
        self.check(batch)?;

        let objective = Objective { loss_mode: config.loss_mode, regime_sign: config.regime_sign };
        let network::Gradients { mut grads, outputs, loss } = self.net.gradients(batch, objective);

        if !loss.is_finite() {
            return Err(SessionError::NumericInstability(format!("loss is {loss}")));
        }

        let gradient_norm = util::l2_norm(&grads);
        if !gradient_norm.is_finite() {
            return Err(SessionError::NumericInstability(format!("gradient norm is {gradient_norm}")));
        }

        if gradient_norm > self.hparams.global_norm {
            let scale = self.hparams.global_norm / gradient_norm;
            grads.iter_mut().for_each(|g| *g *= scale);
        }

        let classes = self.shape().classes;
        let metrics = StepMetrics {
            loss,
            move_accuracy: network::move_accuracy(&outputs.policy, batch.policy(), classes),
            outcome_accuracy: network::outcome_accuracy(&outputs.value, batch.outcomes()),
            gradient_norm,
            temperature: self.net.temperature(),
        };

        self.optimiser.update(self.net.weights_mut(), &grads, config.learning_rate);
        self.step += 1;

        Ok(metrics)
    }

    pub fn eval_step(&self, batch: &EncodedBatch) -> Result<EvalMetrics, SessionError> {
        self.check(batch)?;

        let outputs = self.net.forward(batch.features());
        let loss = self.net.loss(&outputs, batch, Objective::default());

        if !loss.is_finite() {
            return Err(SessionError::NumericInstability(format!("loss is {loss}")));
        }

        Ok(EvalMetrics {
            loss,
            move_accuracy: network::move_accuracy(&outputs.policy, batch.policy(), self.shape().classes),
            outcome_accuracy: network::outcome_accuracy(&outputs.value, batch.outcomes()),
        })
    }

    fn meta(&self) -> Meta {
        Meta {
            model: self.net.kind(),
            optimiser: self.optimiser.kind(),
            step: self.step,
            size: self.net.size(),
            shape: self.shape(),
            hidden: self.hparams.hidden,
            residual_units: self.hparams.residual_units,
        }
    }

    /// Writes weights, optimiser state and the step counter into the directory `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        util::write_f32s(self.net.weights(), path.join(WEIGHTS_FILE))?;
        self.optimiser.write_to_checkpoint(&path.join(OPTIMISER_DIR))?;

        let meta = serde_json::to_string_pretty(&self.meta())?;
        fs::write(path.join(META_FILE), meta)?;

        log::debug!("Saved step {} to {}", self.step, path.display());
        Ok(())
    }

    /// Restores a snapshot written by [`ComputeSession::save`]. Nothing is modified unless
    /// the whole snapshot reads back and matches this session's architecture.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let corrupt = |reason: String| PersistenceError::Corrupt { path: path.to_path_buf(), reason };

        let meta_path = path.join(META_FILE);
        let meta = match fs::read_to_string(&meta_path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(PersistenceError::Missing(path.to_path_buf())),
            Err(e) => return Err(e.into()),
        };

        let meta: Meta = serde_json::from_str(&meta)?;
        let ours = self.meta();

        if meta.model != ours.model {
            return Err(corrupt(format!("model {} does not match {}", meta.model, ours.model)));
        }

        if meta.shape != ours.shape || meta.hidden != ours.hidden || meta.residual_units != ours.residual_units {
            return Err(corrupt(format!(
                "architecture {} (hidden {}, {} residual) does not match {} (hidden {}, {} residual)",
                meta.shape, meta.hidden, meta.residual_units, ours.shape, ours.hidden, ours.residual_units
            )));
        }

        if meta.size != ours.size {
            return Err(corrupt(format!("{} parameters, expected {}", meta.size, ours.size)));
        }

        let weights = util::read_f32s(path.join(WEIGHTS_FILE), ours.size)?;

        let mut optimiser = Optimiser::new(ours.optimiser, ours.size, self.hparams.momentum);
        if meta.optimiser == ours.optimiser {
            optimiser.load_from_checkpoint(&path.join(OPTIMISER_DIR), meta.step)?;
        } else {
            log::warn!("Checkpoint was trained with {}, starting {} state from scratch", meta.optimiser, ours.optimiser);
        }

        self.net.weights_mut().copy_from_slice(&weights);
        self.optimiser = optimiser;
        self.step = meta.step;

        Ok(())
    }
}

/// A [`ComputeSession`] shared between the trainer and search/protocol clients. Every
/// call holds the lock for its whole duration, so steps and inferences never interleave.
#[derive(Clone)]
pub struct SharedSession(Arc<Mutex<ComputeSession>>);

impl SharedSession {
    pub fn new(session: ComputeSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn lock(&self) -> MutexGuard<'_, ComputeSession> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn infer(&self, features: &[f32]) -> Result<Inference, SessionError> {
        self.lock().infer(features)
    }
}

/// Path of a snapshot directory inside `checkpoint_dir`.
pub fn snapshot_path(checkpoint_dir: &Path, accuracy: f32, step: u64) -> PathBuf {
    checkpoint_dir.join(format!("model-{accuracy:.4}-{step}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;

    fn shape() -> BoardShape {
        BoardShape::new(3, 3, 2, 10).unwrap()
    }

    fn session(seed: u64) -> ComputeSession {
        let hparams = Hparams { hidden: 8, threads: 2, seed: Some(seed), ..Hparams::default() };
        ComputeSession::new(ModelKind::Relu, OptimiserKind::Momentum, shape(), 4, &hparams).unwrap()
    }

    fn batch() -> Batch {
        let features = (0..72).map(|i| (i % 3 == 0) as u8 as f32).collect();
        let mut policy = vec![0.0; 40];
        for i in 0..4 {
            policy[i * 10 + i] = 1.0;
        }
        Batch { features, policy, outcomes: vec![1.0, 0.0, 0.0, 1.0] }
    }

    fn config() -> StepConfig {
        StepConfig { learning_rate: 0.1, loss_mode: LossMode::Sparse, regime_sign: 1.0 }
    }

    #[test]
    fn construction_rejects_unusable_hparams() {
        let hparams = Hparams { hidden: 8, threads: 1, temperature: 0.0, ..Hparams::default() };
        let built = ComputeSession::new(ModelKind::Relu, OptimiserKind::Sgd, shape(), 4, &hparams);
        assert!(matches!(built, Err(ConfigError::InvalidHparam(_))));

        let hparams = Hparams { hidden: 8, threads: 1, global_norm: f32::NAN, ..Hparams::default() };
        let built = ComputeSession::new(ModelKind::Relu, OptimiserKind::Sgd, shape(), 4, &hparams);
        assert!(matches!(built, Err(ConfigError::InvalidHparam(_))));
    }

    #[test]
    fn infer_is_pure() {
        let session = session(1);
        let features = batch().encode(shape()).features().to_vec();

        let a = session.infer(&features).unwrap();
        let b = session.infer(&features).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(a.policy_for(2).len(), 10);

        assert!(session.infer(&features[..18]).is_err());
    }

    #[test]
    fn train_step_counts_and_bad_batches_do_not() {
        let mut session = session(2);
        let before = session.network().weights().to_vec();

        let metrics = session.train_step(&batch().encode(shape()), config()).unwrap();
        assert_eq!(session.step(), 1);
        assert!(metrics.loss.is_finite());
        assert_eq!(metrics.temperature, 1.0);
        assert_ne!(session.network().weights(), before.as_slice());

        let after = session.network().weights().to_vec();
        let mut bad = batch();
        bad.features[5] = f32::NAN;

        let err = session.train_step(&bad.encode(shape()), config());
        assert!(matches!(err, Err(SessionError::NumericInstability(_))));
        assert_eq!(session.step(), 1);
        assert_eq!(session.network().weights(), after.as_slice());
    }

    #[test]
    fn gradient_norm_is_reported_before_clipping() {
        let hparams = Hparams { hidden: 8, threads: 1, seed: Some(3), global_norm: 1e-3, ..Hparams::default() };
        let mut session = ComputeSession::new(ModelKind::Elu, OptimiserKind::Sgd, shape(), 4, &hparams).unwrap();
        let before = session.network().weights().to_vec();

        let metrics = session.train_step(&batch().encode(shape()), config()).unwrap();
        assert!(metrics.gradient_norm > 1e-3);

        let moved: f32 =
            before.iter().zip(session.network().weights()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>().sqrt();
        assert!((moved - 0.1 * 1e-3).abs() < 1e-5);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");

        let mut trained = session(4);
        trained.train_step(&batch().encode(shape()), config()).unwrap();
        trained.train_step(&batch().encode(shape()), config()).unwrap();
        trained.save(&path).unwrap();

        let mut restored = session(5);
        restored.load(&path).unwrap();
        assert_eq!(restored.step(), 2);

        let features = batch().encode(shape()).features().to_vec();
        assert_eq!(trained.infer(&features).unwrap(), restored.infer(&features).unwrap());

        trained.train_step(&batch().encode(shape()), config()).unwrap();
        restored.train_step(&batch().encode(shape()), config()).unwrap();
        assert_eq!(trained.network().weights(), restored.network().weights());
    }

    #[test]
    fn missing_and_truncated_snapshots_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(6);

        assert!(matches!(session.load(dir.path().join("nothing")), Err(PersistenceError::Missing(_))));

        let path = dir.path().join("snapshot");
        session.save(&path).unwrap();
        let bytes = fs::read(path.join(WEIGHTS_FILE)).unwrap();
        fs::write(path.join(WEIGHTS_FILE), &bytes[..bytes.len() / 2]).unwrap();

        let before = session.network().weights().to_vec();
        assert!(matches!(session.load(&path), Err(PersistenceError::Corrupt { .. })));
        assert_eq!(session.network().weights(), before.as_slice());
    }

    #[test]
    fn shared_session_serialises_access() {
        let shared = SharedSession::new(session(7));
        let features = batch().encode(shape()).features().to_vec();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                let features = features.clone();
                std::thread::spawn(move || shared.infer(&features).unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
