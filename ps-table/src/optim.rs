//! Optimizer arithmetic, transcribed from
//! `original_source/kraken/ps/optim/*.cc`.

use ps_errors::{PsError, PsResult};
use ps_tensor::{DenseTensor, StateKind, Tensor, Value};
use serde::{Deserialize, Serialize};

/// A concrete optimizer and its hyperparameters. `update` is the only entry
/// point the table engine calls; every variant shares the same
/// precondition checks (COO no-op on empty indices, shape/dtype match).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Optimizer {
    Sgd {
        weight_decay: Option<f32>,
        momentum: Option<f32>,
        dampening: f32,
        nesterov: bool,
    },
    Adagrad {
        eps: f32,
        weight_decay: Option<f32>,
    },
    Adam {
        beta1: f32,
        beta2: f32,
        eps: f32,
        amsgrad: bool,
    },
    RmsProp {
        alpha: f32,
        eps: f32,
        centered: bool,
        momentum: Option<f32>,
    },
}

impl Optimizer {
    /// Apply one gradient step to `value` in place. `grad`'s densified
    /// shape/dtype must match `value.val`; an empty-indices COO gradient is
    /// a no-op success (nothing to apply).
    pub fn update(&self, grad: &Tensor, lr: f32, value: &mut Value) -> PsResult<()> {
        if grad.is_empty_coo() {
            return Ok(());
        }
        let grad = grad.densify();
        if grad.shape != value.val.shape {
            return Err(PsError::GradientUnCompatible);
        }

        match self {
            Optimizer::Sgd {
                weight_decay,
                momentum,
                dampening,
                nesterov,
            } => Self::sgd(value, &grad, lr, *weight_decay, *momentum, *dampening, *nesterov),
            Optimizer::Adagrad { eps, weight_decay } => Self::adagrad(value, &grad, lr, *eps, *weight_decay),
            Optimizer::Adam {
                beta1,
                beta2,
                eps,
                amsgrad,
            } => Self::adam(value, &grad, lr, *beta1, *beta2, *eps, *amsgrad),
            Optimizer::RmsProp {
                alpha,
                eps,
                centered,
                momentum,
            } => Self::rmsprop(value, &grad, lr, *alpha, *eps, *centered, *momentum),
        }
        Ok(())
    }

    fn sgd(
        value: &mut Value,
        grad: &DenseTensor,
        lr: f32,
        weight_decay: Option<f32>,
        momentum: Option<f32>,
        dampening: f32,
        nesterov: bool,
    ) {
        let mut grad = grad.clone();
        if let Some(wd) = weight_decay {
            grad += &(&value.val * wd);
        }
        let effective = if let Some(m) = momentum {
            let first_touch = !value.states.contains_key(&StateKind::MomentumBuffer);
            let mb = value.state_or_zero_like(StateKind::MomentumBuffer, &grad);
            if first_touch {
                *mb = grad.clone();
            } else {
                *mb = &(&*mb * m) + &(&grad * (1.0 - dampening));
            }
            if nesterov {
                &grad + &(&*mb * m)
            } else {
                mb.clone()
            }
        } else {
            grad
        };
        value.val -= &(&effective * lr);
    }

    fn adagrad(value: &mut Value, grad: &DenseTensor, lr: f32, eps: f32, weight_decay: Option<f32>) {
        let mut grad = grad.clone();
        if let Some(wd) = weight_decay {
            grad += &(&value.val * wd);
        }
        let state_sum = value.state_or_zero_like(StateKind::StateSum, &grad);
        *state_sum += &grad.square();
        let denom = state_sum.sqrt().add_scalar(eps);
        value.val -= &(&(&grad / &denom) * lr);
    }

    fn adam(
        value: &mut Value,
        grad: &DenseTensor,
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        amsgrad: bool,
    ) {
        let m = value.state_or_zero_like(StateKind::FirstMoment, grad);
        *m = &(&*m * beta1) + &(grad * (1.0 - beta1));
        let m = m.clone();

        let v = value.state_or_zero_like(StateKind::SecondMoment, grad);
        *v = &(&*v * beta2) + &(&grad.square() * (1.0 - beta2));
        let v = v.clone();

        let steps = value.bump_steps(StateKind::Steps);
        let bias1 = 1.0 - beta1.powi(steps as i32);
        let bias2 = 1.0 - beta2.powi(steps as i32);
        let mt = &m / bias1;
        let vt = &v / bias2;

        let denom = if amsgrad {
            let v_max = value.state_or_zero_like(StateKind::SecondMomentMax, grad);
            *v_max = v_max.max(&vt);
            v_max.sqrt().add_scalar(eps)
        } else {
            vt.sqrt().add_scalar(eps)
        };
        value.val -= &(&(&mt / &denom) * lr);
    }

    fn rmsprop(
        value: &mut Value,
        grad: &DenseTensor,
        lr: f32,
        alpha: f32,
        eps: f32,
        centered: bool,
        momentum: Option<f32>,
    ) {
        let square_avg = value.state_or_zero_like(StateKind::SquareAverage, grad);
        *square_avg = &(&*square_avg * alpha) + &(&grad.square() * (1.0 - alpha));
        let square_avg = square_avg.clone();

        let avg = if centered {
            let g_ave = value.state_or_zero_like(StateKind::GAve, grad);
            *g_ave = &(&*g_ave * alpha) + &(&*grad * (1.0 - alpha));
            &square_avg - &g_ave.square()
        } else {
            square_avg
        };
        let denom = avg.sqrt().add_scalar(eps);

        if let Some(m) = momentum {
            let buf = value.state_or_zero_like(StateKind::MomentumBuffer, grad);
            *buf = &(&*buf * m) + &(grad / &denom);
            let buf = buf.clone();
            value.val -= &(&buf * lr);
        } else {
            value.val -= &(&(grad / &denom) * lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_tensor::ElementType;

    fn dense(v: Vec<f32>) -> DenseTensor {
        DenseTensor::new(vec![v.len() as i64], ElementType::F32, v)
    }

    #[test]
    fn sgd_plain_descent() {
        let mut value = Value::new(dense(vec![1.0, 1.0]));
        let grad = Tensor::Dense(dense(vec![0.5, 0.5]));
        let opt = Optimizer::Sgd {
            weight_decay: None,
            momentum: None,
            dampening: 0.0,
            nesterov: false,
        };
        opt.update(&grad, 0.1, &mut value).unwrap();
        assert_eq!(value.val.data, vec![0.95, 0.95]);
    }

    #[test]
    fn sgd_momentum_first_touch_equals_grad() {
        let mut value = Value::new(dense(vec![0.0]));
        let grad = Tensor::Dense(dense(vec![1.0]));
        let opt = Optimizer::Sgd {
            weight_decay: None,
            momentum: Some(0.9),
            dampening: 0.0,
            nesterov: false,
        };
        opt.update(&grad, 1.0, &mut value).unwrap();
        assert_eq!(value.val.data, vec![-1.0]);
        assert_eq!(
            value.states[&StateKind::MomentumBuffer].data,
            vec![1.0]
        );
    }

    #[test]
    fn adagrad_accumulates_state_sum() {
        let mut value = Value::new(dense(vec![1.0]));
        let grad = Tensor::Dense(dense(vec![2.0]));
        let opt = Optimizer::Adagrad { eps: 1e-8, weight_decay: None };
        opt.update(&grad, 0.1, &mut value).unwrap();
        assert_eq!(value.states[&StateKind::StateSum].data, vec![4.0]);
        let expected = 1.0 - 0.1 * 2.0 / (4.0f32.sqrt() + 1e-8);
        assert!((value.val.data[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn adam_bias_correction_uses_step_count() {
        let mut value = Value::new(dense(vec![0.0]));
        let grad = Tensor::Dense(dense(vec![1.0]));
        let opt = Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: false,
        };
        opt.update(&grad, 0.001, &mut value).unwrap();
        assert_eq!(value.state_counters[&StateKind::Steps], 1);
        // after one step m=0.1, v=0.001, bias-corrected mt=1.0, vt=1.0
        let expected = -0.001 * 1.0 / (1.0f32.sqrt() + 1e-8);
        assert!((value.val.data[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn empty_coo_gradient_is_a_no_op() {
        let mut value = Value::new(dense(vec![5.0]));
        let grad = Tensor::Coo(ps_tensor::CooTensor {
            indices: vec![],
            values: dense(vec![]),
            shape: vec![1],
        });
        let opt = Optimizer::Sgd {
            weight_decay: None,
            momentum: None,
            dampening: 0.0,
            nesterov: false,
        };
        opt.update(&grad, 1.0, &mut value).unwrap();
        assert_eq!(value.val.data, vec![5.0]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut value = Value::new(dense(vec![1.0, 2.0]));
        let grad = Tensor::Dense(dense(vec![1.0]));
        let opt = Optimizer::Adagrad { eps: 1e-8, weight_decay: None };
        assert_eq!(
            opt.update(&grad, 0.1, &mut value),
            Err(PsError::GradientUnCompatible)
        );
    }
}
