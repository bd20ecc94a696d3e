use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize};

use super::logger::ansi;

/// Which kind of targets the network is being fitted to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    /// Recorded expert games, one-hot move targets.
    #[default]
    Supervised,
    /// Self-play games, visit-count distributions as targets.
    Reinforcement,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervised => write!(f, "supervised"),
            Self::Reinforcement => write!(f, "reinforcement"),
        }
    }
}

/// Learning rate scheduling. Types implementing this trait output a learning rate
/// for a given number of completed optimisation steps.
pub trait LrScheduler: Clone + Debug + Send + Sync {
    fn lr(&self, step: u64) -> f32;

    /// A colourful display representation of the learning rate scheduler.
    fn colourful(&self) -> String;
}

/// Piecewise-constant rate; each entry applies while `step < bound`.
#[derive(Clone, Debug)]
pub struct StepTableLR {
    pub table: &'static [(u64, f32)],
    pub last: f32,
}

const SUPERVISED: StepTableLR = StepTableLR {
    table: &[(200_000, 1e-1), (400_000, 1e-2), (600_000, 1e-3), (700_000, 1e-4), (800_000, 1e-5)],
    last: 1e-5,
};

const REINFORCEMENT: StepTableLR = StepTableLR {
    table: &[(200_000, 1e-2), (400_000, 1e-2), (600_000, 1e-3), (700_000, 1e-4), (800_000, 1e-4)],
    last: 1e-4,
};

impl StepTableLR {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Supervised => SUPERVISED,
            Regime::Reinforcement => REINFORCEMENT,
        }
    }
}

impl LrScheduler for StepTableLR {
    fn lr(&self, step: u64) -> f32 {
        self.table.iter().find(|&&(bound, _)| step < bound).map_or(self.last, |&(_, lr)| lr)
    }

    fn colourful(&self) -> String {
        let mut out = String::new();
        for &(bound, lr) in self.table {
            out += &format!("{} until step {}, ", ansi(lr, 31), ansi(bound, 31));
        }
        out + &format!("then {}", ansi(self.last, 31))
    }
}

pub fn scheduled_lr(step: u64, regime: Regime) -> f32 {
    StepTableLR::for_regime(regime).lr(step)
}

/// Step counter and regime for a training run. The learning rate is never set directly:
/// every constructor and [`TrainingState::advance`] re-derive it from the schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingState {
    cumulative_step: u64,
    regime: Regime,
    learning_rate: f32,
}

impl TrainingState {
    pub fn new(cumulative_step: u64) -> Self {
        Self::with_regime(cumulative_step, Regime::Supervised)
    }

    pub fn with_regime(cumulative_step: u64, regime: Regime) -> Self {
        Self { cumulative_step, regime, learning_rate: scheduled_lr(cumulative_step, regime) }
    }

    /// Records one completed optimisation step; the new rate applies to the next one.
    pub fn advance(&mut self) {
        self.cumulative_step += 1;
        self.learning_rate = scheduled_lr(self.cumulative_step, self.regime);
    }

    pub fn cumulative_step(&self) -> u64 {
        self.cumulative_step
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervised_boundaries() {
        let cases = [
            (0, 1e-1),
            (199_999, 1e-1),
            (200_000, 1e-2),
            (200_001, 1e-2),
            (399_999, 1e-2),
            (400_000, 1e-3),
            (400_001, 1e-3),
            (599_999, 1e-3),
            (600_000, 1e-4),
            (600_001, 1e-4),
            (699_999, 1e-4),
            (700_000, 1e-5),
            (700_001, 1e-5),
            (799_999, 1e-5),
            (800_000, 1e-5),
            (800_001, 1e-5),
            (5_000_000, 1e-5),
        ];

        for (step, lr) in cases {
            assert_eq!(scheduled_lr(step, Regime::Supervised), lr, "step {step}");
        }
    }

    #[test]
    fn reinforcement_boundaries() {
        let cases = [
            (0, 1e-2),
            (199_999, 1e-2),
            (200_000, 1e-2),
            (200_001, 1e-2),
            (399_999, 1e-2),
            (400_000, 1e-3),
            (400_001, 1e-3),
            (599_999, 1e-3),
            (600_000, 1e-4),
            (600_001, 1e-4),
            (699_999, 1e-4),
            (700_000, 1e-4),
            (700_001, 1e-4),
            (799_999, 1e-4),
            (800_000, 1e-4),
            (800_001, 1e-4),
            (10_000_000, 1e-4),
        ];

        for (step, lr) in cases {
            assert_eq!(scheduled_lr(step, Regime::Reinforcement), lr, "step {step}");
        }
    }

    #[test]
    fn state_rate_follows_step() {
        let mut state = TrainingState::new(199_999);
        assert_eq!(state.learning_rate(), 1e-1);

        state.advance();
        assert_eq!(state.cumulative_step(), 200_000);
        assert_eq!(state.learning_rate(), 1e-2);

        let state = TrainingState::with_regime(0, Regime::Reinforcement);
        assert_eq!(state.learning_rate(), 1e-2);
    }
}
