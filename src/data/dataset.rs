use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{Batch, BatchSource, BoardShape};

/// One recorded position: binary feature planes, the move target distribution, and the
/// game outcome from the point of view of the player to move (1 win, 0 loss).
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub features: Vec<u8>,
    pub policy: Vec<f32>,
    pub outcome: f32,
}

/// An in-memory set of positions that hands out batches in shuffled order.
pub struct DataSet {
    shape: BoardShape,
    positions: Vec<Position>,
    index_in_epoch: usize,
    epochs_completed: usize,
    rng: StdRng,
}

impl DataSet {
    pub fn new(shape: BoardShape, positions: Vec<Position>) -> Self {
        Self::with_rng(shape, positions, StdRng::from_entropy())
    }

    pub fn with_seed(shape: BoardShape, positions: Vec<Position>, seed: u64) -> Self {
        Self::with_rng(shape, positions, StdRng::seed_from_u64(seed))
    }

    fn with_rng(shape: BoardShape, positions: Vec<Position>, rng: StdRng) -> Self {
        Self { shape, positions, index_in_epoch: 0, epochs_completed: 0, rng }
    }

    pub fn shape(&self) -> BoardShape {
        self.shape
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn into_positions(self) -> Vec<Position> {
        self.positions
    }

    /// Number of full passes handed out so far.
    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn shuffle(&mut self) {
        self.positions.shuffle(&mut self.rng);
        self.index_in_epoch = 0;
    }

    pub fn get_batch(&mut self, batch_size: usize) -> Batch {
        let mut batch = Batch {
            features: Vec::with_capacity(batch_size * self.shape.input_size()),
            policy: Vec::with_capacity(batch_size * self.shape.classes),
            outcomes: Vec::with_capacity(batch_size),
        };

        if self.positions.is_empty() {
            return batch;
        }

        if self.index_in_epoch + batch_size > self.positions.len() {
            self.epochs_completed += 1;
            self.shuffle();
        }

        let start = self.index_in_epoch;
        self.index_in_epoch += batch_size;

        // wraps only when one batch is larger than the whole set
        let count = self.positions.len();
        for i in 0..batch_size {
            let pos = &self.positions[(start + i) % count];
            batch.features.extend(pos.features.iter().map(|&x| f32::from(x)));
            batch.policy.extend_from_slice(&pos.policy);
            batch.outcomes.push(pos.outcome);
        }

        batch
    }
}

impl BatchSource for DataSet {
    fn data_size(&self) -> usize {
        self.positions.len()
    }

    fn next_batch(&mut self, batch_size: usize) -> Batch {
        self.get_batch(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(n: usize) -> Vec<Position> {
        (0..n)
            .map(|i| Position { features: vec![(i % 2) as u8; 2], policy: vec![i as f32, 0.0], outcome: 1.0 })
            .collect()
    }

    #[test]
    fn batches_cover_epoch_before_reshuffling() {
        let shape = BoardShape::new(1, 1, 2, 2).unwrap();
        let mut data = DataSet::with_seed(shape, positions(6), 7);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = data.get_batch(2);
            assert_eq!(batch.len(), 2);
            assert_eq!(batch.features.len(), 4);
            seen.extend(batch.policy.chunks(2).map(|p| p[0] as usize));
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(data.epochs_completed(), 0);

        data.get_batch(2);
        assert_eq!(data.epochs_completed(), 1);
    }

    #[test]
    fn oversized_batch_wraps() {
        let shape = BoardShape::new(1, 1, 2, 2).unwrap();
        let mut data = DataSet::with_seed(shape, positions(3), 1);

        let batch = data.get_batch(5);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn empty_set_gives_empty_batch() {
        let shape = BoardShape::new(1, 1, 2, 2).unwrap();
        let mut data = DataSet::with_seed(shape, Vec::new(), 1);
        assert!(data.get_batch(4).is_empty());
    }
}
