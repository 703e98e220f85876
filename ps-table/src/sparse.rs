//! `SparseTable`: rows created on demand, sharded across `SLOT_COUNT` locks.

use ps_errors::{PsError, PsResult};
use ps_tensor::{DenseTensor, ElementType, Initializer, Tensor, Value};

use crate::optim::Optimizer;
use crate::slotmap::SlottedMap;

/// A sparse table: a shell (name, dimension, element type, initializer)
/// shipped to every node, with rows partitioned across the cluster by the
/// routing ring and, locally, across `SLOT_COUNT` independently-locked
/// slots. Grounded in spec.md §4.5's `SparseTable`.
pub struct SparseTable {
    pub table_id: u64,
    pub name: String,
    pub dimension: u64,
    pub element_type: ElementType,
    pub init_spec: Initializer,
    rows: SlottedMap<Value>,
}

impl SparseTable {
    pub fn new(
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: ElementType,
        init_spec: Initializer,
    ) -> Self {
        SparseTable {
            table_id,
            name,
            dimension,
            element_type,
            init_spec,
            rows: SlottedMap::new(),
        }
    }

    fn row_shape(&self) -> Vec<i64> {
        vec![self.dimension as i64]
    }

    fn fresh_row(&self) -> Value {
        Value::new(self.init_spec.initialize(self.row_shape(), self.element_type))
    }

    /// Size-match check, group by slot, per-slot unique lock, create rows
    /// on first touch, apply the optimizer.
    pub fn push(&self, sparse_ids: &[u64], grads: &[Tensor], lr: f32, optim: &Optimizer) -> PsResult<()> {
        if sparse_ids.len() != grads.len() {
            return Err(PsError::GradientUnCompatible);
        }
        let pairs: Vec<(u64, &Tensor)> = sparse_ids.iter().copied().zip(grads.iter()).collect();
        let groups = SlottedMap::<Value>::group_by_slot(&pairs, |(id, _)| *id);
        for (slot_idx, members) in groups {
            self.rows.with_slot_write(slot_idx, |map| -> PsResult<()> {
                for (id, grad) in members {
                    let mut row = map.get(id).map(|e| e.value().clone()).unwrap_or_else(|| self.fresh_row());
                    optim.update(*grad, lr, &mut row)?;
                    map.insert(*id, row);
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Group by slot, shared lock per slot; a miss synthesizes a fresh row
    /// via the initializer without inserting it (read-only pull never
    /// creates rows).
    pub fn pull(&self, sparse_ids: &[u64]) -> Vec<DenseTensor> {
        let groups = SlottedMap::<Value>::group_by_slot(sparse_ids, |id| *id);
        let mut out: Vec<(u64, DenseTensor)> = Vec::with_capacity(sparse_ids.len());
        for (slot_idx, members) in groups {
            self.rows.with_slot_read(slot_idx, |map| {
                for &&id in &members {
                    let value = map
                        .get(&id)
                        .map(|e| e.value().val.clone())
                        .unwrap_or_else(|| self.fresh_row().val);
                    out.push((id, value));
                }
            });
        }
        // restore caller order
        sparse_ids
            .iter()
            .map(|id| out.iter().find(|(k, _)| k == id).unwrap().1.clone())
            .collect()
    }

    /// Bulk-insert rows during transfer, first-insert-wins per row.
    pub fn insert(&self, sparse_ids: &[u64], values: &[DenseTensor]) {
        for (&id, v) in sparse_ids.iter().zip(values.iter()) {
            self.rows.insert_if_absent(id, Value::new(v.clone()));
        }
    }

    pub fn contains(&self, sparse_id: u64) -> bool {
        self.rows.contains(sparse_id)
    }

    /// Copy up to `batch_size` rows from slot `slot_idx` at or after
    /// `cursor`, for the donor's transfer iteration cursor.
    pub fn batch_from(&self, slot_idx: usize, cursor: u64, batch_size: usize) -> Vec<(u64, DenseTensor)> {
        self.rows
            .batch_from(slot_idx, cursor, batch_size)
            .into_iter()
            .map(|(id, v)| (id, v.val))
            .collect()
    }

    /// Remove rows in slot `slot_idx` whose `hash(table_id, sparse_id)` no
    /// longer maps here, run by the donor's post-transfer clean-up.
    pub fn retain_slot(&self, slot_idx: usize, keep: impl Fn(u64) -> bool) {
        self.rows.retain_slot(slot_idx, keep);
    }

    pub fn slot_count(&self) -> usize {
        self.rows.slot_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SparseTable {
        SparseTable::new(
            9,
            "emb".into(),
            4,
            ElementType::F32,
            Initializer::Constant(0.0),
        )
    }

    #[test]
    fn pull_synthesizes_without_inserting() {
        let t = table();
        let pulled = t.pull(&[42]);
        assert_eq!(pulled[0].data, vec![0.0; 4]);
        assert!(!t.contains(42));
    }

    #[test]
    fn push_creates_row_on_first_touch() {
        let t = table();
        let grad = Tensor::Dense(DenseTensor::new(vec![4], ElementType::F32, vec![1.0; 4]));
        let opt = Optimizer::Sgd {
            weight_decay: None,
            momentum: None,
            dampening: 0.0,
            nesterov: false,
        };
        t.push(&[7], &[grad], 0.1, &opt).unwrap();
        assert!(t.contains(7));
        let pulled = t.pull(&[7]);
        assert_eq!(pulled[0].data, vec![-0.1; 4]);
    }

    #[test]
    fn insert_is_first_write_wins() {
        let t = table();
        let a = DenseTensor::new(vec![4], ElementType::F32, vec![1.0; 4]);
        let b = DenseTensor::new(vec![4], ElementType::F32, vec![2.0; 4]);
        t.insert(&[1], &[a]);
        t.insert(&[1], &[b]);
        assert_eq!(t.pull(&[1])[0].data, vec![1.0; 4]);
    }

    #[test]
    fn push_rejects_length_mismatch() {
        let t = table();
        let grad = Tensor::Dense(DenseTensor::new(vec![4], ElementType::F32, vec![1.0; 4]));
        let opt = Optimizer::Adagrad { eps: 1e-8, weight_decay: None };
        assert_eq!(
            t.push(&[1, 2], &[grad], 0.1, &opt),
            Err(PsError::GradientUnCompatible)
        );
    }
}
