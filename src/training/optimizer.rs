//! Adam optimizer and the linear learning-rate schedule

use serde::{Deserialize, Serialize};

/// Linear (power 1) polynomial decay from the initial to the final learning
/// rate over a fixed number of steps, clamped at the final rate afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolynomialDecay {
    initial: f32,
    end: f32,
    decay_steps: usize,
}

impl PolynomialDecay {
    pub fn new(initial: f32, end: f32, decay_steps: usize) -> Self {
        Self {
            initial,
            end,
            decay_steps: decay_steps.max(1),
        }
    }

    pub fn learning_rate(&self, step: usize) -> f32 {
        let t = step.min(self.decay_steps) as f32 / self.decay_steps as f32;
        (self.initial - self.end) * (1.0 - t) + self.end
    }
}

/// Adam with bias correction. Optimizer state is keyed by parameter slot; the
/// model hands out slots in a fixed traversal order so state follows the same
/// parameter across steps.
#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Advance the shared timestep. Call once per training step, before the
    /// per-slot updates.
    pub fn begin_step(&mut self) {
        self.t += 1;
    }

    pub fn update(&mut self, slot: usize, lr: f32, params: &mut [f32], grads: &[f32]) {
        while self.m.len() <= slot {
            self.m.push(Vec::new());
            self.v.push(Vec::new());
        }
        if self.m[slot].len() != params.len() {
            self.m[slot] = vec![0.0; params.len()];
            self.v[slot] = vec![0.0; params.len()];
        }

        let t = self.t.max(1);
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);
        let m = &mut self.m[slot];
        let v = &mut self.v[slot];
        for i in 0..params.len() {
            let g = grads[i];
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = m[i] / bc1;
            let v_hat = v[i] / bc2;
            params[i] -= lr * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_endpoints() {
        let schedule = PolynomialDecay::new(0.045, 0.0001, 100);
        assert!((schedule.learning_rate(0) - 0.045).abs() < 1e-7);
        assert!((schedule.learning_rate(50) - 0.02255).abs() < 1e-5);
        assert!((schedule.learning_rate(100) - 0.0001).abs() < 1e-7);
        // clamped past the end of the schedule
        assert!((schedule.learning_rate(1000) - 0.0001).abs() < 1e-7);
    }

    #[test]
    fn test_first_step_moves_by_roughly_lr() {
        let mut opt = Adam::new();
        opt.begin_step();
        let mut params = [0.0f32];
        opt.update(0, 0.1, &mut params, &[4.2]);
        // bias correction makes the first update magnitude ~ lr
        assert!((params[0] + 0.1).abs() < 1e-3, "params {}", params[0]);
    }

    #[test]
    fn test_adam_converges_on_quadratic() {
        let mut opt = Adam::new();
        let mut params = [10.0f32];
        for _ in 0..500 {
            opt.begin_step();
            let grad = [2.0 * (params[0] - 3.0)];
            opt.update(0, 0.1, &mut params, &grad);
        }
        assert!((params[0] - 3.0).abs() < 0.05, "params {}", params[0]);
    }

    #[test]
    fn test_slots_keep_independent_state() {
        let mut opt = Adam::new();
        let mut a = [0.0f32];
        let mut b = [0.0f32, 0.0];
        opt.begin_step();
        opt.update(0, 0.1, &mut a, &[1.0]);
        opt.update(1, 0.1, &mut b, &[1.0, -1.0]);
        opt.begin_step();
        opt.update(0, 0.1, &mut a, &[1.0]);
        opt.update(1, 0.1, &mut b, &[1.0, -1.0]);
        assert!(a[0] < 0.0);
        assert!(b[0] < 0.0 && b[1] > 0.0);
    }
}
