//! On-disk record shapes for a single table's dense or sparse file.

use ps_tensor::{DenseTensor, ElementType, Initializer};
use serde::{Deserialize, Serialize};

const DENSE_KIND: u8 = 0;
const SPARSE_KIND: u8 = 1;

/// `<table_name>.dense`: `table_kind, table_id, table_name, value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseRecord {
    pub table_kind: u8,
    pub table_id: u64,
    pub table_name: String,
    pub value: DenseTensor,
}

impl DenseRecord {
    pub fn new(table_id: u64, table_name: String, value: DenseTensor) -> Self {
        DenseRecord { table_kind: DENSE_KIND, table_id, table_name, value }
    }
}

/// One slot's rows, preserved so restore places them back without
/// re-hashing: `count, [sparse_id, value]*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseSlot {
    pub rows: Vec<(u64, DenseTensor)>,
}

/// `<table_name>.sparse`: `table_kind, table_id, table_name, dimension,
/// element_type, init_kind, init_params, slot_count, [slot]*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRecord {
    pub table_kind: u8,
    pub table_id: u64,
    pub table_name: String,
    pub dimension: u64,
    pub element_type: ElementType,
    pub init_spec: Initializer,
    pub slots: Vec<SparseSlot>,
}

impl SparseRecord {
    pub fn new(
        table_id: u64,
        table_name: String,
        dimension: u64,
        element_type: ElementType,
        init_spec: Initializer,
        slots: Vec<SparseSlot>,
    ) -> Self {
        SparseRecord {
            table_kind: SPARSE_KIND,
            table_id,
            table_name,
            dimension,
            element_type,
            init_spec,
            slots,
        }
    }
}
