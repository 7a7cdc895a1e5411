//! Adam with inspectable, persistable state
//!
//! Candle's built-in optimisers keep their moments private, which makes a
//! resumed run start from cold moments. This implementation keeps the first
//! and second moments per named parameter so they can go into a checkpoint
//! and come back bit-identical.

use candle_core::{DType, Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::gradients::Gradients;

const EXP_AVG: &str = ".exp_avg";
const EXP_AVG_SQ: &str = ".exp_avg_sq";
const PARAM_STEP: &str = ".step";
const GLOBAL_STEP: &str = "step";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient (not decoupled)
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamConfig {
    /// Learning rate and betas recommended for DCGAN-style adversarial training
    pub fn gan() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            ..Default::default()
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

pub struct Adam {
    config: AdamConfig,
    step: usize,

    // State for each parameter
    state: HashMap<String, MomentState>,
}

struct MomentState {
    m: Tensor, // First moment
    v: Tensor, // Second moment
    step: usize,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            step: 0,
            state: HashMap::new(),
        }
    }

    /// Update every parameter that has an accumulated gradient.
    pub fn step(&mut self, params: &[(String, Var)], grads: &Gradients) -> Result<()> {
        self.step += 1;

        for (name, var) in params {
            if let Some(grad) = grads.get(name) {
                self.update_param(name, var, grad)?;
            }
        }

        Ok(())
    }

    fn update_param(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let param = var.as_tensor().detach();
        let grad = if self.config.weight_decay != 0.0 {
            (grad + (&param * self.config.weight_decay)?)?
        } else {
            grad.clone()
        };

        // Get or create state
        if !self.state.contains_key(name) {
            self.state.insert(
                name.to_string(),
                MomentState {
                    m: param.zeros_like()?,
                    v: param.zeros_like()?,
                    step: 0,
                },
            );
        }
        let Some(state) = self.state.get_mut(name) else {
            candle_core::bail!("missing optimiser state for {}", name);
        };
        state.step += 1;

        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;

        // Bias corrections
        let bias_correction1 = 1.0 - beta1.powi(state.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(state.step as i32);

        // Update moments
        state.m = ((&state.m * beta1)? + (&grad * (1.0 - beta1))?)?;
        state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        // Bias-corrected moments
        let m_hat = (&state.m / bias_correction1)?;
        let v_hat = (&state.v / bias_correction2)?;

        // Parameter update
        let update = (m_hat / (v_hat.sqrt()? + self.config.eps)?)?;
        var.set(&(param - (update * self.config.lr)?)?)
    }

    /// Snapshot of every moment and counter, keyed for a flat tensor archive.
    ///
    /// Keys: `step`, `<param>.exp_avg`, `<param>.exp_avg_sq`, `<param>.step`.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut dict = HashMap::new();
        dict.insert(GLOBAL_STEP.to_string(), step_tensor(self.step)?);

        for (name, state) in &self.state {
            dict.insert(format!("{}{}", name, EXP_AVG), state.m.clone());
            dict.insert(format!("{}{}", name, EXP_AVG_SQ), state.v.clone());
            dict.insert(format!("{}{}", name, PARAM_STEP), step_tensor(state.step)?);
        }

        Ok(dict)
    }

    /// Replace all state with the contents of a [`Adam::state_dict`] snapshot.
    pub fn load_state_dict(&mut self, dict: &HashMap<String, Tensor>, device: &Device) -> Result<()> {
        let step = dict
            .get(GLOBAL_STEP)
            .ok_or_else(|| candle_core::Error::Msg("optimiser state has no `step`".to_string()))?;
        let step = read_step(step)?;

        let mut state = HashMap::new();
        for (key, m) in dict {
            let Some(name) = key.strip_suffix(EXP_AVG) else {
                continue;
            };
            let v = dict.get(&format!("{}{}", name, EXP_AVG_SQ)).ok_or_else(|| {
                candle_core::Error::Msg(format!("optimiser state has no second moment for {}", name))
            })?;
            let param_step = dict.get(&format!("{}{}", name, PARAM_STEP)).ok_or_else(|| {
                candle_core::Error::Msg(format!("optimiser state has no step for {}", name))
            })?;

            state.insert(
                name.to_string(),
                MomentState {
                    m: m.to_device(device)?,
                    v: v.to_device(device)?,
                    step: read_step(param_step)?,
                },
            );
        }

        self.step = step;
        self.state = state;
        Ok(())
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    /// Number of parameters with moments, i.e. updated at least once
    pub fn tracked_params(&self) -> usize {
        self.state.len()
    }
}

fn step_tensor(step: usize) -> Result<Tensor> {
    Tensor::new(step as i64, &Device::Cpu)
}

fn read_step(tensor: &Tensor) -> Result<usize> {
    Ok(tensor.to_dtype(DType::I64)?.to_scalar::<i64>()? as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradients::Gradients;

    fn quadratic_step(adam: &mut Adam, w: &Var, params: &[(String, Var)]) -> Result<()> {
        let mut grads = Gradients::new();
        grads.backward(&w.as_tensor().sqr()?.sum_all()?, params)?;
        adam.step(params, &grads)
    }

    #[test]
    fn test_optimizer_creation() {
        let adam = Adam::new(AdamConfig::default());
        assert_eq!(adam.get_step(), 0);
        assert_eq!(adam.tracked_params(), 0);
    }

    #[test]
    fn test_gan_config() {
        let config = AdamConfig::gan();
        assert_eq!(config.lr, 2e-4);
        assert_eq!(config.beta1, 0.5);
        assert_eq!(config.beta2, 0.999);
    }

    #[test]
    fn test_first_step_moves_by_lr() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, -2.0], &device)?;
        let params = vec![("w".to_string(), w.clone())];
        let mut adam = Adam::new(AdamConfig::default().with_lr(0.1));

        quadratic_step(&mut adam, &w, &params)?;

        // bias-corrected first step is lr * sign(grad)
        let values = w.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 1.9).abs() < 1e-5);
        assert_eq!(adam.get_step(), 1);
        Ok(())
    }

    #[test]
    fn test_skips_params_without_grad() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32], &device)?;
        let frozen = Var::new(&[5f32], &device)?;
        let params = vec![("frozen".to_string(), frozen.clone()), ("w".to_string(), w.clone())];
        let mut adam = Adam::new(AdamConfig::default());

        let mut grads = Gradients::new();
        grads.backward(&w.as_tensor().sqr()?.sum_all()?, &params)?;
        adam.step(&params, &grads)?;

        assert_eq!(frozen.as_tensor().to_vec1::<f32>()?, vec![5.0]);
        assert_eq!(adam.tracked_params(), 1);
        Ok(())
    }

    #[test]
    fn test_state_dict_restores_trajectory() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[0.5f32, -1.5, 3.0], &device)?;
        let params = vec![("w".to_string(), w.clone())];
        let mut adam = Adam::new(AdamConfig::gan());
        for _ in 0..3 {
            quadratic_step(&mut adam, &w, &params)?;
        }

        // Fork: restore a second optimiser and a copy of the parameter
        let w_copy = Var::new(w.as_tensor().to_vec1::<f32>()?.as_slice(), &device)?;
        let copy_params = vec![("w".to_string(), w_copy.clone())];
        let mut restored = Adam::new(AdamConfig::gan());
        restored.load_state_dict(&adam.state_dict()?, &device)?;
        assert_eq!(restored.get_step(), 3);

        quadratic_step(&mut adam, &w, &params)?;
        quadratic_step(&mut restored, &w_copy, &copy_params)?;

        assert_eq!(
            w.as_tensor().to_vec1::<f32>()?,
            w_copy.as_tensor().to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_load_rejects_partial_state() -> Result<()> {
        let device = Device::Cpu;
        let mut dict = HashMap::new();
        dict.insert("step".to_string(), Tensor::new(1i64, &device)?);
        dict.insert("w.exp_avg".to_string(), Tensor::zeros(2, DType::F32, &device)?);

        let mut adam = Adam::new(AdamConfig::default());
        assert!(adam.load_state_dict(&dict, &device).is_err());
        Ok(())
    }
}
