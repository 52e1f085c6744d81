//! Loss functions: a scalar value plus the gradient with respect to the prediction.

use crate::data::Array;
use crate::error::{Result, TrainError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A differentiable `(prediction, target) -> scalar` callable.
///
/// Backends call [`Loss::gradient`] during the backward part of a closure and
/// sum the gradients of all configured losses.
pub trait Loss: Send + Sync {
    fn value(&self, prediction: &Array, target: &Array) -> Result<f64>;

    /// d(value)/d(prediction), same shape as `prediction`.
    fn gradient(&self, prediction: &Array, target: &Array) -> Result<Array>;
}

/// Named losses, in a stable order.
pub type LossMap = BTreeMap<String, Arc<dyn Loss>>;

fn check_shapes(prediction: &Array, target: &Array) -> Result<()> {
    if prediction.len() != target.len() {
        return Err(TrainError::ShapeMismatch {
            expected: prediction.shape().to_vec(),
            actual: target.shape().to_vec(),
        });
    }
    Ok(())
}

fn elementwise_grad(
    prediction: &Array,
    target: &Array,
    f: impl Fn(f64) -> f64,
) -> Result<Array> {
    check_shapes(prediction, target)?;
    let n = prediction.len().max(1) as f64;
    let grads = prediction
        .data()
        .iter()
        .zip(target.data())
        .map(|(p, t)| f(p - t) / n)
        .collect();
    Array::new(prediction.shape().to_vec(), grads)
}

fn elementwise_mean(prediction: &Array, target: &Array, f: impl Fn(f64) -> f64) -> Result<f64> {
    check_shapes(prediction, target)?;
    if prediction.is_empty() {
        return Ok(0.0);
    }
    let total: f64 = prediction
        .data()
        .iter()
        .zip(target.data())
        .map(|(p, t)| f(p - t))
        .sum();
    Ok(total / prediction.len() as f64)
}

/// Mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn value(&self, prediction: &Array, target: &Array) -> Result<f64> {
        elementwise_mean(prediction, target, |d| d * d)
    }

    fn gradient(&self, prediction: &Array, target: &Array) -> Result<Array> {
        elementwise_grad(prediction, target, |d| 2.0 * d)
    }
}

/// Mean absolute error.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl Loss for L1Loss {
    fn value(&self, prediction: &Array, target: &Array) -> Result<f64> {
        elementwise_mean(prediction, target, f64::abs)
    }

    fn gradient(&self, prediction: &Array, target: &Array) -> Result<Array> {
        elementwise_grad(prediction, target, |d| if d == 0.0 { 0.0 } else { d.signum() })
    }
}

/// Quadratic near zero, linear beyond `delta`.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    pub delta: f64,
}

impl Default for HuberLoss {
    fn default() -> Self {
        Self { delta: 1.0 }
    }
}

impl Loss for HuberLoss {
    fn value(&self, prediction: &Array, target: &Array) -> Result<f64> {
        let delta = self.delta;
        elementwise_mean(prediction, target, |d| {
            if d.abs() <= delta {
                0.5 * d * d
            } else {
                delta * (d.abs() - 0.5 * delta)
            }
        })
    }

    fn gradient(&self, prediction: &Array, target: &Array) -> Result<Array> {
        let delta = self.delta;
        elementwise_grad(prediction, target, |d| d.clamp(-delta, delta))
    }
}

/// Look up a built-in loss by its configuration name.
pub fn loss_by_name(name: &str) -> Result<Arc<dyn Loss>> {
    match name {
        "mse" | "l2" => Ok(Arc::new(MseLoss)),
        "l1" | "mae" => Ok(Arc::new(L1Loss)),
        "huber" | "smooth_l1" => Ok(Arc::new(HuberLoss::default())),
        other => Err(TrainError::UnknownComponent {
            kind: "loss",
            name: other.to_string(),
        }),
    }
}

pub fn build_losses(names: &[String]) -> Result<LossMap> {
    names
        .iter()
        .map(|name| Ok((name.clone(), loss_by_name(name)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(values: &[f64]) -> Array {
        Array::new(vec![values.len(), 1], values.to_vec()).unwrap()
    }

    #[test]
    fn test_mse_value_and_gradient() {
        let p = arr(&[1.0, 2.0]);
        let t = arr(&[0.0, 4.0]);
        assert_eq!(MseLoss.value(&p, &t).unwrap(), 2.5);
        assert_eq!(MseLoss.gradient(&p, &t).unwrap().data(), &[1.0, -2.0]);
    }

    #[test]
    fn test_l1_gradient_is_sign() {
        let p = arr(&[1.0, 2.0, 3.0, 4.0]);
        let t = arr(&[0.0, 4.0, 3.0, 4.5]);
        assert_eq!(L1Loss.value(&p, &t).unwrap(), 3.5 / 4.0);
        assert_eq!(
            L1Loss.gradient(&p, &t).unwrap().data(),
            &[0.25, -0.25, 0.0, -0.25]
        );
    }

    #[test]
    fn test_huber_switches_regime() {
        let huber = HuberLoss { delta: 1.0 };
        let t = arr(&[0.0, 0.0]);
        assert_eq!(huber.value(&arr(&[0.5, 3.0]), &t).unwrap(), (0.125 + 2.5) / 2.0);
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(MseLoss.value(&arr(&[1.0]), &arr(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn test_unknown_loss() {
        assert!(loss_by_name("mse").is_ok());
        assert!(matches!(
            loss_by_name("focal"),
            Err(TrainError::UnknownComponent { kind: "loss", .. })
        ));
    }
}
