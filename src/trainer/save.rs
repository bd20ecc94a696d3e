use std::{
    collections::VecDeque,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    data::BatchSource,
    error::PersistenceError,
    session::{self, ComputeSession},
};

pub const INDEX_FILE: &str = "checkpoints.json";
pub const MAX_SNAPSHOTS: usize = 10;
/// Evaluations with a mean move accuracy above this are worth keeping.
pub const SAVE_THRESHOLD: f32 = 0.2;

/// Aggregated metrics over the batches of one evaluation pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationResult {
    pub mean_loss: f32,
    pub mean_move_accuracy: f32,
    pub mean_outcome_accuracy: f32,
    pub batches_evaluated: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub path: PathBuf,
    pub accuracy: f32,
    pub step: u64,
}

/// Runs `eval_step` over `floor(data_size / batch_size * proportion)` batches of `source`.
///
/// Returns `None` if that count is zero, if `proportion` is outside `(0, 1]`, or if every
/// drawn batch was numerically invalid. Sums are divided by `batches_evaluated - 0.01`.
pub fn evaluate(
    session: &ComputeSession,
    mut source: impl BatchSource,
    proportion: f64,
) -> Option<EvaluationResult> {
    let batch_size = session.batch_size();
    let minibatches = source.data_size() / batch_size;

    let planned = if proportion > 0.0 && proportion <= 1.0 { (minibatches as f64 * proportion) as usize } else { 0 };

    if planned == 0 {
        log::debug!("Nothing to evaluate: {minibatches} minibatches at proportion {proportion}");
        return None;
    }

    let shape = session.shape();
    let (mut loss, mut move_acc, mut outcome_acc) = (0.0, 0.0, 0.0);
    let mut evaluated = 0;

    for i in 0..planned {
        let batch = source.next_batch(batch_size).encode(shape);

        match session.eval_step(&batch) {
            Ok(metrics) => {
                loss += metrics.loss;
                move_acc += metrics.move_accuracy;
                outcome_acc += metrics.outcome_accuracy;
                evaluated += 1;
            }
            Err(err) => log::warn!("Evaluation batch {} corrupts. Discard. ({err})", i + 1),
        }
    }

    if evaluated == 0 {
        return None;
    }

    let denom = evaluated as f32 - 1e-2;
    Some(EvaluationResult {
        mean_loss: loss / denom,
        mean_move_accuracy: move_acc / denom,
        mean_outcome_accuracy: outcome_acc / denom,
        batches_evaluated: evaluated,
    })
}

/// Decides which evaluated states are persisted and keeps at most [`MAX_SNAPSHOTS`] of them,
/// evicting the oldest first. The ordered list lives in `checkpoints.json`.
pub struct CheckpointPolicy {
    dir: PathBuf,
    snapshots: VecDeque<ModelSnapshot>,
}

impl CheckpointPolicy {
    /// Opens `dir`, picking up the retention index left by a previous run if there is one.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let snapshots = read_index(&dir)?.unwrap_or_default();
        Ok(Self { dir, snapshots })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ModelSnapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&ModelSnapshot> {
        self.snapshots.back()
    }

    /// Persists a snapshot if `result` clears [`SAVE_THRESHOLD`] or `force` is set.
    pub fn maybe_checkpoint(
        &mut self,
        session: &ComputeSession,
        result: &EvaluationResult,
        force: bool,
    ) -> Result<Option<ModelSnapshot>, PersistenceError> {
        if result.mean_move_accuracy > SAVE_THRESHOLD || force {
            self.checkpoint(session, result.mean_move_accuracy).map(Some)
        } else {
            Ok(None)
        }
    }

    fn checkpoint(&mut self, session: &ComputeSession, accuracy: f32) -> Result<ModelSnapshot, PersistenceError> {
        let path = session::snapshot_path(&self.dir, accuracy, session.step());
        session.save(&path)?;

        let snapshot = ModelSnapshot { path, accuracy, step: session.step() };
        self.snapshots.retain(|s| s.path != snapshot.path);
        self.snapshots.push_back(snapshot.clone());

        while self.snapshots.len() > MAX_SNAPSHOTS {
            if let Some(old) = self.snapshots.pop_front() {
                evict(&old);
            }
        }

        self.write_index()?;
        log::info!("Saved {} (accuracy {:.4}, step {})", snapshot.path.display(), accuracy, snapshot.step);

        Ok(snapshot)
    }

    fn write_index(&self) -> Result<(), PersistenceError> {
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(&self.snapshots)?)?;
        fs::rename(tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}

/// Resolves a resume path: a checkpoint directory resolves to its latest snapshot, anything
/// else is taken to be a snapshot itself.
pub fn resolve_resume_path(path: &Path) -> Result<PathBuf, PersistenceError> {
    match read_index(path)? {
        Some(snapshots) => {
            snapshots.back().map(|s| s.path.clone()).ok_or_else(|| PersistenceError::Missing(path.join(INDEX_FILE)))
        }
        None => Ok(path.to_path_buf()),
    }
}

fn read_index(dir: &Path) -> Result<Option<VecDeque<ModelSnapshot>>, PersistenceError> {
    match fs::read_to_string(dir.join(INDEX_FILE)) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn evict(snapshot: &ModelSnapshot) {
    match fs::remove_dir_all(&snapshot.path) {
        Ok(()) => log::debug!("Evicted {}", snapshot.path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove old snapshot {}: {e}", snapshot.path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Batch, BoardShape, DataSet, Position},
        network::ModelKind,
        optimiser::OptimiserKind,
        trainer::settings::Hparams,
    };

    fn shape() -> BoardShape {
        BoardShape::new(2, 2, 2, 5).unwrap()
    }

    fn session() -> ComputeSession {
        let hparams = Hparams { hidden: 4, threads: 1, seed: Some(11), ..Hparams::default() };
        ComputeSession::new(ModelKind::Relu, OptimiserKind::Momentum, shape(), 4, &hparams).unwrap()
    }

    fn result(accuracy: f32) -> EvaluationResult {
        EvaluationResult { mean_loss: 1.0, mean_move_accuracy: accuracy, mean_outcome_accuracy: 0.5, batches_evaluated: 1 }
    }

    fn positions(n: usize) -> Vec<Position> {
        (0..n)
            .map(|i| {
                let mut policy = vec![0.0; 5];
                policy[i % 5] = 1.0;
                Position { features: (0..8).map(|j| ((i + j) % 2) as u8).collect(), policy, outcome: (i % 2) as f32 }
            })
            .collect()
    }

    struct Counting<S> {
        inner: S,
        drawn: usize,
    }

    impl<S: BatchSource> BatchSource for Counting<S> {
        fn data_size(&self) -> usize {
            self.inner.data_size()
        }

        fn next_batch(&mut self, batch_size: usize) -> Batch {
            self.drawn += 1;
            self.inner.next_batch(batch_size)
        }
    }

    /// Batch `i` is always built from the same four positions; listed batches carry a NaN.
    struct Poisoned {
        positions: Vec<Position>,
        poisoned: Vec<usize>,
        drawn: usize,
    }

    impl Poisoned {
        fn new(poisoned: Vec<usize>) -> Self {
            Self { positions: positions(40), poisoned, drawn: 0 }
        }

        fn batch(&self, i: usize) -> Batch {
            let mut batch = Batch::default();
            for pos in &self.positions[4 * i..4 * i + 4] {
                batch.features.extend(pos.features.iter().map(|&x| f32::from(x)));
                batch.policy.extend_from_slice(&pos.policy);
                batch.outcomes.push(pos.outcome);
            }
            batch
        }
    }

    impl BatchSource for Poisoned {
        fn data_size(&self) -> usize {
            self.positions.len()
        }

        fn next_batch(&mut self, _: usize) -> Batch {
            let mut batch = self.batch(self.drawn);
            if self.poisoned.contains(&self.drawn) {
                batch.features[3] = f32::NAN;
            }

            self.drawn += 1;
            batch
        }
    }

    #[test]
    fn invalid_evaluation_batches_are_skipped() {
        let session = session();
        let mut source = Poisoned::new(vec![1, 4, 7]);

        let result = evaluate(&session, &mut source, 1.0).unwrap();
        assert_eq!(source.drawn, 10);
        assert_eq!(result.batches_evaluated, 7);

        let (mut loss, mut move_acc) = (0.0, 0.0);
        for i in (0..10).filter(|i| ![1, 4, 7].contains(i)) {
            let metrics = session.eval_step(&source.batch(i).encode(shape())).unwrap();
            loss += metrics.loss;
            move_acc += metrics.move_accuracy;
        }

        assert!((result.mean_loss - loss / 6.99).abs() < 1e-5);
        assert!((result.mean_move_accuracy - move_acc / 6.99).abs() < 1e-5);
    }

    #[test]
    fn fully_invalid_evaluation_is_none() {
        let session = session();
        let mut source = Poisoned::new((0..10).collect());

        assert!(evaluate(&session, &mut source, 0.5).is_none());
        assert_eq!(source.drawn, 5);
    }

    #[test]
    fn threshold_and_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = CheckpointPolicy::open(dir.path()).unwrap();
        let session = session();

        assert!(policy.maybe_checkpoint(&session, &result(0.25), false).unwrap().is_some());
        assert!(policy.maybe_checkpoint(&session, &result(0.15), false).unwrap().is_none());

        let forced = policy.maybe_checkpoint(&session, &result(0.05), true).unwrap().unwrap();
        assert!(forced.path.ends_with("model-0.0500-0"));
        assert!(forced.path.join("weights.bin").is_file());
        assert_eq!(policy.len(), 2);
    }

    #[test]
    fn eleventh_snapshot_evicts_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = CheckpointPolicy::open(dir.path()).unwrap();
        let session = session();

        let saved: Vec<_> = (0..11)
            .map(|i| policy.maybe_checkpoint(&session, &result(0.3 + i as f32 / 100.0), false).unwrap().unwrap())
            .collect();

        assert_eq!(policy.len(), MAX_SNAPSHOTS);
        assert!(!saved[0].path.exists());
        assert!(saved[1..].iter().all(|s| s.path.exists()));
        assert_eq!(policy.latest(), Some(&saved[10]));

        let reopened = CheckpointPolicy::open(dir.path()).unwrap();
        assert_eq!(reopened.snapshots().collect::<Vec<_>>(), policy.snapshots().collect::<Vec<_>>());
        assert_eq!(resolve_resume_path(dir.path()).unwrap(), saved[10].path);
    }

    #[test]
    fn evaluates_the_requested_proportion() {
        let session = session();
        let mut source = Counting { inner: DataSet::with_seed(shape(), positions(400), 1), drawn: 0 };

        let result = evaluate(&session, &mut source, 0.1).unwrap();
        assert_eq!(source.drawn, 10);
        assert_eq!(result.batches_evaluated, 10);
        assert!(result.mean_move_accuracy >= 0.0);

        assert!(evaluate(&session, &mut source, 0.0).is_none());
        assert!(evaluate(&session, &mut source, 1.5).is_none());
        assert_eq!(source.drawn, 10);

        let mut tiny = DataSet::with_seed(shape(), positions(30), 1);
        assert!(evaluate(&session, &mut tiny, 0.1).is_none());
    }
}
