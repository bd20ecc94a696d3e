pub mod chunk;
pub mod dataset;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use dataset::{DataSet, Position};

/// Dimensions of a single encoded position and of the move space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardShape {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub classes: usize,
}

impl BoardShape {
    /// 19x19 board, 17 feature planes, every point plus pass.
    pub const GO: Self = Self { rows: 19, cols: 19, channels: 17, classes: 19 * 19 + 1 };

    pub fn new(rows: usize, cols: usize, channels: usize, classes: usize) -> Result<Self, ConfigError> {
        let shape = Self { rows, cols, channels, classes };

        if rows == 0 || cols == 0 || channels == 0 {
            return Err(ConfigError::InvalidShape(format!("{shape}: board dimensions must be positive")));
        }

        if classes < 2 {
            return Err(ConfigError::InvalidShape(format!("{shape}: need at least two move classes")));
        }

        Ok(shape)
    }

    /// Number of values in one position's feature tensor.
    pub fn input_size(&self) -> usize {
        self.rows * self.cols * self.channels
    }

    /// Index of the player-to-move plane, which is always the last one.
    pub fn colour_channel(&self) -> usize {
        self.channels - 1
    }
}

impl fmt::Display for BoardShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{} -> {}", self.rows, self.cols, self.channels, self.classes)
    }
}

/// Maps a stored {0, 1} value onto the {-1, +1} range the network is trained with.
pub fn to_signed(x: f32) -> f32 {
    (x - 0.5) * 2.0
}

/// Inverse of [`to_signed`].
pub fn to_unit(x: f32) -> f32 {
    x / 2.0 + 0.5
}

/// Remaps the player-to-move plane of every position in `features` in place.
///
/// Search and protocol clients call this before [`crate::session::SharedSession::infer`].
pub fn encode_features(features: &mut [f32], shape: BoardShape) {
    let colour = shape.colour_channel();
    for point in features.chunks_exact_mut(shape.channels) {
        point[colour] = to_signed(point[colour]);
    }
}

pub fn decode_features(features: &mut [f32], shape: BoardShape) {
    let colour = shape.colour_channel();
    for point in features.chunks_exact_mut(shape.channels) {
        point[colour] = to_unit(point[colour]);
    }
}

/// A group of positions as they come off disk: channel-last features, move targets and
/// game outcomes, with the colour plane and outcome still in {0, 1}.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub features: Vec<f32>,
    pub policy: Vec<f32>,
    pub outcomes: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Applies the colour-plane and outcome remap. This is the only way to obtain an
    /// [`EncodedBatch`], so nothing reaches the network without it.
    pub fn encode(mut self, shape: BoardShape) -> EncodedBatch {
        encode_features(&mut self.features, shape);
        self.outcomes.iter_mut().for_each(|z| *z = to_signed(*z));

        EncodedBatch { features: self.features, policy: self.policy, outcomes: self.outcomes }
    }
}

/// A [`Batch`] after the fixed {0, 1} -> {-1, +1} remap.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedBatch {
    features: Vec<f32>,
    policy: Vec<f32>,
    outcomes: Vec<f32>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }

    pub fn policy(&self) -> &[f32] {
        &self.policy
    }

    pub fn outcomes(&self) -> &[f32] {
        &self.outcomes
    }

    pub fn decode(mut self, shape: BoardShape) -> Batch {
        decode_features(&mut self.features, shape);
        self.outcomes.iter_mut().for_each(|z| *z = to_unit(*z));

        Batch { features: self.features, policy: self.policy, outcomes: self.outcomes }
    }
}

/// Produces shuffled, fixed-size batches of recorded positions.
pub trait BatchSource {
    /// Number of positions available in one pass over the data.
    fn data_size(&self) -> usize;

    /// The next `batch_size` positions. Sources wrap around (and typically reshuffle)
    /// when a pass over the data is exhausted.
    fn next_batch(&mut self, batch_size: usize) -> Batch;
}

impl<T: BatchSource + ?Sized> BatchSource for &mut T {
    fn data_size(&self) -> usize {
        (**self).data_size()
    }

    fn next_batch(&mut self, batch_size: usize) -> Batch {
        (**self).next_batch(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_inverts_exactly() {
        for x in [0.0, 1.0] {
            let y = to_signed(x);
            assert!(y == -1.0 || y == 1.0);
            assert_eq!(to_unit(y), x);
        }
    }

    #[test]
    fn encode_only_touches_colour_plane_and_outcome() {
        let shape = BoardShape::new(1, 2, 3, 2).unwrap();
        let batch = Batch {
            features: vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0],
            policy: vec![1.0, 0.0],
            outcomes: vec![0.0],
        };

        let encoded = batch.clone().encode(shape);
        assert_eq!(encoded.features(), &[1.0, 0.0, -1.0, 0.0, 1.0, 1.0]);
        assert_eq!(encoded.outcomes(), &[-1.0]);
        assert_eq!(encoded.policy(), &[1.0, 0.0]);

        assert_eq!(encoded.decode(shape), batch);
    }

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(BoardShape::new(0, 19, 17, 362).is_err());
        assert!(BoardShape::new(19, 19, 17, 1).is_err());
        assert_eq!(BoardShape::new(19, 19, 17, 362).unwrap(), BoardShape::GO);
        assert_eq!(BoardShape::GO.input_size(), 6137);
    }
}
