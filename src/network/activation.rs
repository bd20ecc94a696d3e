/// Hidden-layer nonlinearity. Derivatives are taken with respect to the
/// pre-activation value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    LeakyReLU { leak: f32 },
    ELU,
}

impl Activation {
    pub fn activate(self, x: f32) -> f32 {
        match self {
            Self::LeakyReLU { leak } => {
                if x < 0.0 {
                    leak * x
                } else {
                    x
                }
            }
            Self::ELU => {
                if x < 0.0 {
                    x.exp_m1()
                } else {
                    x
                }
            }
        }
    }

    pub fn prime(self, x: f32) -> f32 {
        match self {
            Self::LeakyReLU { leak } => {
                if x < 0.0 {
                    leak
                } else {
                    1.0
                }
            }
            Self::ELU => {
                if x < 0.0 {
                    x.exp()
                } else {
                    1.0
                }
            }
        }
    }
}
