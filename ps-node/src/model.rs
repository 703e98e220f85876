//! The tables map (`model_mu`): every dense and sparse table this node
//! currently holds, plus the model-wide optimizer configuration.

use std::collections::HashMap;

use ps_errors::{PsError, PsResult};
use ps_table::{DenseTable, Optimizer, SparseTable};
use ps_tensor::{DenseTensor, ElementType, Initializer};
use ps_wire::OptimConfig;

/// Translate a wire [`OptimConfig`] into a concrete [`Optimizer`]. Grounded
/// in `original_source/kraken/ps/optim/*.cc`'s named-parameter construction.
pub fn build_optimizer(cfg: &OptimConfig) -> PsResult<Optimizer> {
    let p = |name: &str| cfg.params.iter().find(|(k, _)| k == name).map(|(_, v)| *v);
    match cfg.kind.as_str() {
        "sgd" => Ok(Optimizer::Sgd {
            weight_decay: p("weight_decay"),
            momentum: p("momentum"),
            dampening: p("dampening").unwrap_or(0.0),
            nesterov: p("nesterov").map(|v| v != 0.0).unwrap_or(false),
        }),
        "adagrad" => Ok(Optimizer::Adagrad {
            eps: p("eps").unwrap_or(1e-10),
            weight_decay: p("weight_decay"),
        }),
        "adam" => Ok(Optimizer::Adam {
            beta1: p("beta1").unwrap_or(0.9),
            beta2: p("beta2").unwrap_or(0.999),
            eps: p("eps").unwrap_or(1e-8),
            amsgrad: p("amsgrad").map(|v| v != 0.0).unwrap_or(false),
        }),
        "rmsprop" => Ok(Optimizer::RmsProp {
            alpha: p("alpha").unwrap_or(0.99),
            eps: p("eps").unwrap_or(1e-8),
            centered: p("centered").map(|v| v != 0.0).unwrap_or(false),
            momentum: p("momentum"),
        }),
        other => Err(PsError::UnSupportOptimType(other.to_string())),
    }
}

/// Everything under `model_mu`: optimizer, and every table this node holds.
pub struct Model {
    pub name: String,
    pub optim_cfg: OptimConfig,
    pub optim: Optimizer,
    pub dense: HashMap<u64, DenseTable>,
    pub sparse: HashMap<u64, SparseTable>,
}

impl Model {
    pub fn new(name: String, optim_cfg: OptimConfig) -> PsResult<Self> {
        let optim = build_optimizer(&optim_cfg)?;
        Ok(Model {
            name,
            optim_cfg,
            optim,
            dense: HashMap::new(),
            sparse: HashMap::new(),
        })
    }

    pub fn create_dense_table(
        &mut self,
        table_id: u64,
        name: String,
        val_template: DenseTensor,
    ) -> PsResult<()> {
        if self.dense.contains_key(&table_id) {
            return Err(PsError::TableAlreadyCreate(table_id));
        }
        self.dense.insert(table_id, DenseTable::new(table_id, name, val_template));
        Ok(())
    }

    pub fn create_sparse_table(
        &mut self,
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: ElementType,
        init_spec: Initializer,
    ) -> PsResult<()> {
        if self.sparse.contains_key(&table_id) {
            return Err(PsError::TableAlreadyCreate(table_id));
        }
        self.sparse.insert(
            table_id,
            SparseTable::new(table_id, name, dimension, element_type, init_spec),
        );
        Ok(())
    }

    pub fn dense_table(&self, table_id: u64) -> PsResult<&DenseTable> {
        self.dense.get(&table_id).ok_or(PsError::TableNotExist(table_id))
    }

    pub fn sparse_table(&self, table_id: u64) -> PsResult<&SparseTable> {
        self.sparse.get(&table_id).ok_or(PsError::TableNotExist(table_id))
    }

    /// The metadata a checkpoint (or a `TryJoin` reply) needs to describe
    /// this model, without any table contents.
    pub fn to_metadata(&self) -> ps_wire::ModelMetaData {
        ps_wire::ModelMetaData {
            name: self.name.clone(),
            optim: self.optim_cfg.clone(),
            dense_tables: self.dense.values().map(|t| (t.table_id, t.name.clone())).collect(),
            sparse_tables: self
                .sparse
                .values()
                .map(|t| (t.table_id, t.name.clone(), t.dimension, t.element_type as u8))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_optimizer_kind_is_rejected() {
        let cfg = OptimConfig {
            kind: "lbfgs".into(),
            params: vec![],
        };
        assert!(matches!(
            build_optimizer(&cfg),
            Err(PsError::UnSupportOptimType(_))
        ));
    }

    #[test]
    fn creating_the_same_dense_table_twice_fails() {
        let mut model = Model::new(
            "m".into(),
            OptimConfig {
                kind: "sgd".into(),
                params: vec![],
            },
        )
        .unwrap();
        let tpl = DenseTensor::new(vec![1], ElementType::F32, vec![0.0]);
        model.create_dense_table(1, "w".into(), tpl.clone()).unwrap();
        assert_eq!(
            model.create_dense_table(1, "w".into(), tpl),
            Err(PsError::TableAlreadyCreate(1))
        );
    }
}
