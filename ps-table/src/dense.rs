//! `DenseTable`: a single row shared by every reader, one writer at a time.

use parking_lot::RwLock;
use ps_errors::PsResult;
use ps_tensor::{DenseTensor, Tensor, Value};

use crate::optim::Optimizer;

/// A dense table: one value, `val_mu` protects it. Grounded in spec.md
/// §4.5's `DenseTable`.
pub struct DenseTable {
    pub table_id: u64,
    pub name: String,
    value: RwLock<Value>,
}

impl DenseTable {
    pub fn new(table_id: u64, name: String, val_template: DenseTensor) -> Self {
        DenseTable {
            table_id,
            name,
            value: RwLock::new(Value::new(val_template)),
        }
    }

    /// Acquire `val_mu` (write) and apply `optim.update`.
    pub fn push(&self, grad: &Tensor, lr: f32, optim: &Optimizer) -> PsResult<()> {
        let mut value = self.value.write();
        optim.update(grad, lr, &mut value)
    }

    /// Acquire `val_mu` (read) and clone the current value. The clone is
    /// mandatory: callers mutate their copy freely.
    pub fn pull(&self) -> DenseTensor {
        self.value.read().val.clone()
    }

    /// A single locked apply followed by a snapshot, equivalent to `push`
    /// then `pull` observed atomically.
    pub fn push_pull(&self, grad: &Tensor, lr: f32, optim: &Optimizer) -> PsResult<DenseTensor> {
        let mut value = self.value.write();
        optim.update(grad, lr, &mut value)?;
        Ok(value.val.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_tensor::ElementType;

    #[test]
    fn push_then_pull_reflects_the_update() {
        let table = DenseTable::new(
            1,
            "w".into(),
            DenseTensor::new(vec![2], ElementType::F32, vec![0.0, 0.0]),
        );
        let grad = Tensor::Dense(DenseTensor::new(vec![2], ElementType::F32, vec![1.0, 1.0]));
        let opt = Optimizer::Sgd {
            weight_decay: None,
            momentum: None,
            dampening: 0.0,
            nesterov: false,
        };
        table.push(&grad, 0.1, &opt).unwrap();
        assert_eq!(table.pull().data, vec![-0.1, -0.1]);
    }

    #[test]
    fn push_pull_is_atomic_snapshot() {
        let table = DenseTable::new(
            1,
            "w".into(),
            DenseTensor::new(vec![1], ElementType::F32, vec![1.0]),
        );
        let grad = Tensor::Dense(DenseTensor::new(vec![1], ElementType::F32, vec![1.0]));
        let opt = Optimizer::Adagrad { eps: 1e-8, weight_decay: None };
        let snapshot = table.push_pull(&grad, 0.1, &opt).unwrap();
        assert_eq!(snapshot, table.pull());
    }
}
