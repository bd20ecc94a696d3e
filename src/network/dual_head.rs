use std::{fmt, ops::Range, thread};

use super::{activation::Activation, argmax, Gradients, LossMode, ModelKind, Network, Objective, Outputs};
use crate::{
    data::{BoardShape, EncodedBatch},
    rng::WeightRng,
    trainer::settings::Hparams,
};

/// Offsets of one fully connected layer inside the flat parameter buffer.
/// Weights are stored row-major, one row per output.
#[derive(Clone, Copy, Debug)]
struct Affine {
    weights: usize,
    biases: usize,
    inputs: usize,
    outputs: usize,
}

impl Affine {
    fn new(offset: &mut usize, inputs: usize, outputs: usize) -> Self {
        let weights = *offset;
        let biases = weights + inputs * outputs;
        *offset = biases + outputs;
        Self { weights, biases, inputs, outputs }
    }

    fn weight_range(&self) -> Range<usize> {
        self.weights..self.biases
    }

    fn forward(&self, params: &[f32], input: &[f32], out: &mut [f32]) {
        let w = &params[self.weight_range()];
        let b = &params[self.biases..self.biases + self.outputs];

        for (o, (row, bias)) in out.iter_mut().zip(w.chunks_exact(self.inputs).zip(b)) {
            *o = bias + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
        }
    }

    /// Accumulates parameter gradients into `grads` and, if given, adds the gradient
    /// with respect to `input` into `d_input`.
    fn backward(&self, params: &[f32], input: &[f32], d_out: &[f32], grads: &mut [f32], d_input: Option<&mut [f32]>) {
        let (gw, gb) = grads[self.weights..self.biases + self.outputs].split_at_mut(self.inputs * self.outputs);

        for ((grow, gb), &d) in gw.chunks_exact_mut(self.inputs).zip(gb.iter_mut()).zip(d_out) {
            if d == 0.0 {
                continue;
            }

            *gb += d;
            for (g, &x) in grow.iter_mut().zip(input) {
                *g += d * x;
            }
        }

        if let Some(d_input) = d_input {
            let w = &params[self.weight_range()];
            for (row, &d) in w.chunks_exact(self.inputs).zip(d_out) {
                for (di, &w) in d_input.iter_mut().zip(row) {
                    *di += w * d;
                }
            }
        }
    }
}

struct Layout {
    input: Affine,
    residual: Vec<Affine>,
    policy: Affine,
    value: Affine,
    size: usize,
}

impl Layout {
    fn new(shape: BoardShape, hidden: usize, residual_units: usize) -> Self {
        let mut offset = 0;
        let input = Affine::new(&mut offset, shape.input_size(), hidden);
        let residual = (0..residual_units).map(|_| Affine::new(&mut offset, hidden, hidden)).collect();
        let policy = Affine::new(&mut offset, hidden, shape.classes);
        let value = Affine::new(&mut offset, hidden, 1);

        Self { input, residual, policy, value, size: offset }
    }

    fn layers(&self) -> impl Iterator<Item = &Affine> {
        std::iter::once(&self.input).chain(&self.residual).chain([&self.policy, &self.value])
    }
}

/// Everything the backward pass needs from a single example's forward pass.
struct Trace {
    /// Pre-activations of the input layer followed by each residual unit.
    pre: Vec<Vec<f32>>,
    /// Hidden state after the input layer and after each residual unit.
    hidden: Vec<Vec<f32>>,
    log_policy: Vec<f32>,
    value: f32,
}

struct Partial {
    grads: Vec<f32>,
    loss: f32,
    policy: Vec<f32>,
    value: Vec<f32>,
}

/// A residual tower with a softmax policy head and a tanh value head, run on the CPU.
///
/// ```text
/// x -> affine -> act -> [h + act(affine(h))] x residual_units -> affine -> softmax(. / T)
///                                                              -> affine -> tanh
/// ```
pub struct DualHeadNet {
    kind: ModelKind,
    shape: BoardShape,
    hidden: usize,
    activation: Activation,
    temperature: f32,
    weight_decay: f32,
    threads: usize,
    layout: Layout,
    weights: Vec<f32>,
}

impl DualHeadNet {
    pub fn new(kind: ModelKind, shape: BoardShape, hparams: &Hparams) -> Self {
        let hidden = hparams.hidden.max(1);
        let layout = Layout::new(shape, hidden, hparams.residual_units);
        let activation = match kind {
            ModelKind::Relu => Activation::LeakyReLU { leak: hparams.relu_leakiness },
            ModelKind::Elu => Activation::ELU,
        };

        let mut net = Self {
            kind,
            shape,
            hidden,
            activation,
            temperature: hparams.temperature,
            weight_decay: hparams.weight_decay,
            threads: hparams.threads.max(1),
            weights: vec![0.0; layout.size],
            layout,
        };

        net.randomise_weights(hparams.seed, hparams.gaussian_init);
        net
    }

    /// Weights drawn with scale `1 / sqrt(fan_in)`, biases zeroed.
    pub fn randomise_weights(&mut self, seed: Option<u64>, use_gaussian: bool) {
        let mut rng = WeightRng::new(seed);
        self.weights.iter_mut().for_each(|w| *w = 0.0);

        for layer in self.layout.layers() {
            let stdev = (1.0 / layer.inputs as f32).sqrt();
            rng.fill(&mut self.weights[layer.weight_range()], stdev, use_gaussian);
        }
    }

    fn trace(&self, x: &[f32]) -> Trace {
        let params = &self.weights;
        let act = self.activation;

        let mut z = vec![0.0; self.hidden];
        self.layout.input.forward(params, x, &mut z);
        let h = z.iter().map(|&z| act.activate(z)).collect();

        let mut pre = vec![z];
        let mut hidden: Vec<Vec<f32>> = vec![h];

        for unit in &self.layout.residual {
            let prev = &hidden[hidden.len() - 1];
            let mut z = vec![0.0; self.hidden];
            unit.forward(params, prev, &mut z);

            let h = prev.iter().zip(&z).map(|(h, &z)| h + act.activate(z)).collect();
            pre.push(z);
            hidden.push(h);
        }

        let last = &hidden[hidden.len() - 1];

        let mut logits = vec![0.0; self.shape.classes];
        self.layout.policy.forward(params, last, &mut logits);
        let log_policy = log_softmax(&logits, self.temperature);

        let mut value = [0.0];
        self.layout.value.forward(params, last, &mut value);

        Trace { pre, hidden, log_policy, value: value[0].tanh() }
    }

    /// Backpropagates a single example, returning its data loss.
    #[allow(clippy::too_many_arguments)]
    fn backprop_example(
        &self,
        x: &[f32],
        target: &[f32],
        outcome: f32,
        objective: Objective,
        scale: f32,
        grads: &mut [f32],
        trace: &Trace,
    ) -> f32 {
        let params = &self.weights;
        let act = self.activation;

        let probs: Vec<f32> = trace.log_policy.iter().map(|lp| lp.exp()).collect();

        let (ce, mut d_logits) = match objective.loss_mode {
            LossMode::Sparse => {
                let best = argmax(target);
                let mut d = probs;
                d[best] -= 1.0;
                (-trace.log_policy[best], d)
            }
            LossMode::Dense => {
                let mass: f32 = target.iter().sum();
                let ce = -target.iter().zip(&trace.log_policy).map(|(t, lp)| t * lp).sum::<f32>();
                let d = probs.iter().zip(target).map(|(p, t)| p * mass - t).collect();
                (ce, d)
            }
        };

        let logit_scale = objective.regime_sign * scale / self.temperature;
        d_logits.iter_mut().for_each(|d| *d *= logit_scale);

        let v = trace.value;
        let d_value = [2.0 * (v - outcome) * (1.0 - v * v) * scale];

        let last = &trace.hidden[trace.hidden.len() - 1];
        let mut dh = vec![0.0; self.hidden];
        self.layout.policy.backward(params, last, &d_logits, grads, Some(dh.as_mut_slice()));
        self.layout.value.backward(params, last, &d_value, grads, Some(dh.as_mut_slice()));

        for (k, unit) in self.layout.residual.iter().enumerate().rev() {
            let dz: Vec<f32> = dh.iter().zip(&trace.pre[k + 1]).map(|(d, &z)| d * act.prime(z)).collect();
            // skip connection: dh passes through unchanged, plus the unit's contribution
            unit.backward(params, &trace.hidden[k], &dz, grads, Some(dh.as_mut_slice()));
        }

        let dz: Vec<f32> = dh.iter().zip(&trace.pre[0]).map(|(d, &z)| d * act.prime(z)).collect();
        self.layout.input.backward(params, x, &dz, grads, None);

        objective.regime_sign * ce + (v - outcome) * (v - outcome)
    }

    fn gradients_range(&self, batch: &EncodedBatch, range: Range<usize>, objective: Objective, scale: f32) -> Partial {
        let inputs = self.shape.input_size();
        let classes = self.shape.classes;

        let mut partial = Partial {
            grads: vec![0.0; self.layout.size],
            loss: 0.0,
            policy: Vec::with_capacity(range.len() * classes),
            value: Vec::with_capacity(range.len()),
        };

        for i in range {
            let x = &batch.features()[i * inputs..(i + 1) * inputs];
            let target = &batch.policy()[i * classes..(i + 1) * classes];
            let outcome = batch.outcomes()[i];

            let trace = self.trace(x);
            partial.loss += self.backprop_example(x, target, outcome, objective, scale, &mut partial.grads, &trace);
            partial.policy.extend(trace.log_policy.iter().map(|lp| lp.exp()));
            partial.value.push(trace.value);
        }

        partial
    }

    fn decay_penalty(&self) -> f32 {
        let sum_sq: f32 =
            self.layout.layers().flat_map(|layer| &self.weights[layer.weight_range()]).map(|w| w * w).sum();
        0.5 * self.weight_decay * sum_sq
    }
}

impl Network for DualHeadNet {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn shape(&self) -> BoardShape {
        self.shape
    }

    fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }

    fn forward(&self, inputs: &[f32]) -> Outputs {
        let input_size = self.shape.input_size();
        let classes = self.shape.classes;
        let n = inputs.len() / input_size;

        let mut outputs = Outputs { policy: vec![0.0; n * classes], value: vec![0.0; n] };
        if n == 0 {
            return outputs;
        }

        let chunk = n.div_ceil(self.threads);

        thread::scope(|s| {
            inputs
                .chunks(chunk * input_size)
                .zip(outputs.policy.chunks_mut(chunk * classes))
                .zip(outputs.value.chunks_mut(chunk))
                .for_each(|((xs, ps), vs)| {
                    s.spawn(move || {
                        for ((x, p), v) in xs.chunks_exact(input_size).zip(ps.chunks_exact_mut(classes)).zip(vs) {
                            let trace = self.trace(x);
                            for (p, lp) in p.iter_mut().zip(&trace.log_policy) {
                                *p = lp.exp();
                            }
                            *v = trace.value;
                        }
                    });
                });
        });

        outputs
    }

    fn loss(&self, outputs: &Outputs, batch: &EncodedBatch, objective: Objective) -> f32 {
        let classes = self.shape.classes;
        let n = batch.len();
        if n == 0 {
            return 0.0;
        }

        let mut total = 0.0;
        let examples = outputs.policy.chunks_exact(classes).zip(batch.policy().chunks_exact(classes));
        for ((p, t), (&v, &z)) in examples.zip(outputs.value.iter().zip(batch.outcomes())) {
            let ce = match objective.loss_mode {
                LossMode::Sparse => -p[argmax(t)].max(f32::MIN_POSITIVE).ln(),
                LossMode::Dense => -t.iter().zip(p).map(|(t, p)| t * p.max(f32::MIN_POSITIVE).ln()).sum::<f32>(),
            };

            total += objective.regime_sign * ce + (v - z) * (v - z);
        }

        total / n as f32 + self.decay_penalty()
    }

    fn gradients(&self, batch: &EncodedBatch, objective: Objective) -> Gradients {
        let n = batch.len();
        let scale = 1.0 / n.max(1) as f32;
        let chunk = n.div_ceil(self.threads).max(1);

        let partials: Vec<Partial> = thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .step_by(chunk)
                .map(|start| {
                    let range = start..(start + chunk).min(n);
                    s.spawn(move || self.gradients_range(batch, range, objective, scale))
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e))).collect()
        });

        let mut grads = vec![0.0; self.layout.size];
        let mut loss = 0.0;
        let mut outputs = Outputs { policy: Vec::with_capacity(batch.policy().len()), value: Vec::with_capacity(n) };

        for partial in partials {
            grads.iter_mut().zip(&partial.grads).for_each(|(g, p)| *g += p);
            loss += partial.loss;
            outputs.policy.extend(partial.policy);
            outputs.value.extend(partial.value);
        }

        for layer in self.layout.layers() {
            let range = layer.weight_range();
            for (g, w) in grads[range.clone()].iter_mut().zip(&self.weights[range]) {
                *g += self.weight_decay * w;
            }
        }

        Gradients { grads, outputs, loss: loss * scale + self.decay_penalty() }
    }
}

impl fmt::Display for DualHeadNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.shape.input_size(), self.hidden)?;

        if !self.layout.residual.is_empty() {
            write!(f, " -> ({} residual)x{}", self.hidden, self.layout.residual.len())?;
        }

        write!(f, " -> ({} policy, 1 value)", self.shape.classes)
    }
}

fn log_softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |m, &x| m.max(x / temperature));
    let sum: f32 = logits.iter().map(|&x| (x / temperature - max).exp()).sum();
    let lse = max + sum.ln();

    logits.iter().map(|&x| x / temperature - lse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;

    fn hparams(seed: u64) -> Hparams {
        Hparams { hidden: 6, residual_units: 2, threads: 2, seed: Some(seed), ..Hparams::default() }
    }

    fn shape() -> BoardShape {
        BoardShape::new(2, 2, 2, 4).unwrap()
    }

    fn batch(policy: Vec<f32>) -> EncodedBatch {
        let features = (0..24).map(|i| ((i * 7) % 5) as f32 / 4.0).collect();
        Batch { features, policy, outcomes: vec![1.0, 0.0, 1.0] }.encode(shape())
    }

    fn soft_targets() -> Vec<f32> {
        vec![0.5, 0.3, 0.2, 0.0, 0.1, 0.1, 0.1, 0.7, 0.25, 0.25, 0.25, 0.25]
    }

    #[test]
    fn forward_outputs_are_distributions() {
        let net = DualHeadNet::new(ModelKind::Relu, shape(), &hparams(1));
        let out = net.forward(batch(soft_targets()).features());

        assert_eq!(out.policy.len(), 12);
        assert_eq!(out.value.len(), 3);

        for p in out.policy.chunks_exact(4) {
            assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }

        assert!(out.value.iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut net = DualHeadNet::new(ModelKind::Elu, shape(), &hparams(2));
        let batch = batch(soft_targets());
        let objective = Objective { loss_mode: LossMode::Dense, regime_sign: 1.0 };

        let analytic = net.gradients(&batch, objective).grads;
        let eps = 1e-2;

        for idx in (0..net.size()).step_by(5) {
            let orig = net.weights[idx];

            net.weights[idx] = orig + eps;
            let plus = net.gradients(&batch, objective).loss;
            net.weights[idx] = orig - eps;
            let minus = net.gradients(&batch, objective).loss;
            net.weights[idx] = orig;

            let numeric = (plus - minus) / (2.0 * eps);
            let tolerance = 1e-2 * analytic[idx].abs().max(1.0);
            assert!(
                (numeric - analytic[idx]).abs() < tolerance,
                "param {idx}: numeric {numeric} vs analytic {}",
                analytic[idx]
            );
        }
    }

    #[test]
    fn sparse_and_dense_targets_pull_differently() {
        let net = DualHeadNet::new(ModelKind::Relu, shape(), &hparams(3));
        let batch = batch(soft_targets());

        let sparse = net.gradients(&batch, Objective { loss_mode: LossMode::Sparse, regime_sign: 1.0 });
        let dense = net.gradients(&batch, Objective { loss_mode: LossMode::Dense, regime_sign: 1.0 });

        let diff: f32 = sparse.grads.iter().zip(&dense.grads).map(|(a, b)| (a - b).abs()).sum();
        assert!(diff > 1e-3);
        assert_eq!(sparse.outputs, dense.outputs);
    }

    #[test]
    fn gradient_outputs_match_forward() {
        let net = DualHeadNet::new(ModelKind::Relu, shape(), &hparams(4));
        let batch = batch(soft_targets());

        let grads = net.gradients(&batch, Objective::default());
        let forward = net.forward(batch.features());

        for (a, b) in grads.outputs.policy.iter().zip(&forward.policy) {
            assert!((a - b).abs() < 1e-6);
        }

        let loss = net.loss(&forward, &batch, Objective::default());
        assert!((loss - grads.loss).abs() < 1e-4);
    }

    #[test]
    fn seeded_networks_are_identical() {
        let a = DualHeadNet::new(ModelKind::Elu, shape(), &hparams(9));
        let b = DualHeadNet::new(ModelKind::Elu, shape(), &hparams(9));
        assert_eq!(a.weights(), b.weights());
        assert_eq!(format!("{a}"), "8 -> 6 -> (6 residual)x2 -> (4 policy, 1 value)");
    }
}
