//! Named gradient accumulation
//!
//! Candle hands back a fresh `GradStore` from every `backward()`. The
//! adversarial loop needs PyTorch-like semantics instead: clear once, run
//! several backward passes that add onto each other, then step. `Gradients`
//! keeps that running sum, restricted to one network's parameters.

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Gradients {
    grads: HashMap<String, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every accumulated gradient (the `zero_grad` of this loop).
    pub fn clear(&mut self) {
        self.grads.clear();
    }

    /// Backpropagate `loss` and add the gradients of `params` onto the running sum.
    ///
    /// Parameters outside `params`, or not reached by `loss`, are ignored.
    pub fn backward(&mut self, loss: &Tensor, params: &[(String, Var)]) -> Result<()> {
        let store = loss.backward()?;

        for (name, var) in params {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let summed = match self.grads.remove(name) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), summed);
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Every trainable variable of a `VarMap`, sorted by name for a stable order.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;

    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
