//! The RPC catalogue: one stable numeric id per call, plus the request
//! payload carried under each.
//!
//! `TryFetchDenseTable` and its batched sibling from the original catalogue
//! are de-duplicated to the single batched `TryCombineFetchDenseTable` form
//! (a single table is just a batch of one).

use ps_router::Router;
use ps_tensor::{DenseTensor, Initializer, Tensor};
use serde::{Deserialize, Serialize};

/// Stable numeric RPC discriminant. Renumbering a variant breaks wire
/// compatibility with any peer running an older build; always append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum RpcKind {
    // Client <-> Scheduler
    TryJoin = 1,
    FetchRouter = 2,
    InitModel = 3,
    RegisterDenseTable = 4,
    RegisterSparseTable = 5,
    TrySaveModel = 6,
    TryLoadModel = 7,
    IsAllPsWorking = 8,

    // Scheduler -> Node
    Heartbeat = 9,
    NotifyNodeJoin = 10,
    CreateModel = 11,
    CreateDenseTable = 12,
    CreateSparseTable = 13,
    TriggerSave = 27,
    TriggerLoad = 28,

    // Node <-> Node (transfer and proxy)
    TransferDenseTable = 14,
    TransferSparseMetaData = 15,
    TransferSparseValues = 16,
    NotifyFinishTransfer = 17,
    TryCombineFetchDenseTable = 18,
    TryFetchSparseMetaData = 19,
    TryFetchSparseValues = 20,

    // Client <-> Node (serving)
    PullDenseTable = 21,
    CombinePullDenseTable = 22,
    PushDenseTable = 23,
    PushPullDenseTable = 24,
    PullSparseTable = 25,
    PushSparseTable = 26,
}

impl RpcKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        use RpcKind::*;
        Some(match v {
            1 => TryJoin,
            2 => FetchRouter,
            3 => InitModel,
            4 => RegisterDenseTable,
            5 => RegisterSparseTable,
            6 => TrySaveModel,
            7 => TryLoadModel,
            8 => IsAllPsWorking,
            9 => Heartbeat,
            10 => NotifyNodeJoin,
            11 => CreateModel,
            12 => CreateDenseTable,
            13 => CreateSparseTable,
            14 => TransferDenseTable,
            15 => TransferSparseMetaData,
            16 => TransferSparseValues,
            17 => NotifyFinishTransfer,
            18 => TryCombineFetchDenseTable,
            19 => TryFetchSparseMetaData,
            20 => TryFetchSparseValues,
            21 => PullDenseTable,
            22 => CombinePullDenseTable,
            23 => PushDenseTable,
            24 => PushPullDenseTable,
            25 => PullSparseTable,
            26 => PushSparseTable,
            27 => TriggerSave,
            28 => TriggerLoad,
            _ => return None,
        })
    }
}

/// The identity a node announces about itself, and the optimizer
/// configuration a model is created with, echoed verbatim on the wire
/// rather than re-derived by the table engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    pub kind: String,
    pub params: Vec<(String, f32)>,
}

/// Every payload carried by some RPC, tagged by its [`RpcKind`]. A single
/// enum keeps the catalogue's numbering and its Rust types next to each
/// other; transports decode the header's `type` first and then decode the
/// matching variant's inner bytes, so this enum itself is never what's
/// length-prefixed on the wire (see `crate::transport`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    TryJoin {
        addr: String,
    },
    FetchRouter,
    InitModel {
        name: String,
        optim: OptimConfig,
    },
    RegisterDenseTable {
        name: String,
        val_template: DenseTensor,
    },
    RegisterSparseTable {
        name: String,
        dimension: u64,
        element_type: u8,
        init_spec: Initializer,
    },
    TrySaveModel,
    TryLoadModel,
    IsAllPsWorking,

    Heartbeat,
    NotifyNodeJoin {
        router: Router,
    },
    CreateModel {
        name: String,
        optim: OptimConfig,
    },
    CreateDenseTable {
        table_id: u64,
        name: String,
        val_template: DenseTensor,
    },
    CreateSparseTable {
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: u8,
        init_spec: Initializer,
    },
    TriggerSave {
        timestamp: String,
    },
    TriggerLoad,

    TransferDenseTable {
        table_id: u64,
        name: String,
        value: DenseTensor,
    },
    TransferSparseMetaData {
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: u8,
        init_spec: Initializer,
    },
    TransferSparseValues {
        table_id: u64,
        sparse_ids: Vec<u64>,
        values: Vec<DenseTensor>,
    },
    NotifyFinishTransfer {
        donor_id: u64,
    },
    TryCombineFetchDenseTable {
        table_ids: Vec<u64>,
    },
    TryFetchSparseMetaData {
        table_id: u64,
    },
    TryFetchSparseValues {
        table_id: u64,
        sparse_ids: Vec<u64>,
    },

    PullDenseTable {
        table_id: u64,
        router_version: u64,
    },
    CombinePullDenseTable {
        table_ids: Vec<u64>,
        router_version: u64,
    },
    PushDenseTable {
        table_id: u64,
        grad: Tensor,
        lr: f32,
        router_version: u64,
    },
    PushPullDenseTable {
        table_id: u64,
        grad: Tensor,
        lr: f32,
        router_version: u64,
    },
    PullSparseTable {
        table_id: u64,
        sparse_ids: Vec<u64>,
        router_version: u64,
    },
    PushSparseTable {
        table_id: u64,
        sparse_ids: Vec<u64>,
        grads: Vec<Tensor>,
        lr: f32,
        router_version: u64,
    },
}

impl RpcRequest {
    pub fn kind(&self) -> RpcKind {
        use RpcRequest::*;
        match self {
            TryJoin { .. } => RpcKind::TryJoin,
            FetchRouter => RpcKind::FetchRouter,
            InitModel { .. } => RpcKind::InitModel,
            RegisterDenseTable { .. } => RpcKind::RegisterDenseTable,
            RegisterSparseTable { .. } => RpcKind::RegisterSparseTable,
            TrySaveModel => RpcKind::TrySaveModel,
            TryLoadModel => RpcKind::TryLoadModel,
            IsAllPsWorking => RpcKind::IsAllPsWorking,
            Heartbeat => RpcKind::Heartbeat,
            NotifyNodeJoin { .. } => RpcKind::NotifyNodeJoin,
            CreateModel { .. } => RpcKind::CreateModel,
            CreateDenseTable { .. } => RpcKind::CreateDenseTable,
            CreateSparseTable { .. } => RpcKind::CreateSparseTable,
            TriggerSave { .. } => RpcKind::TriggerSave,
            TriggerLoad => RpcKind::TriggerLoad,
            TransferDenseTable { .. } => RpcKind::TransferDenseTable,
            TransferSparseMetaData { .. } => RpcKind::TransferSparseMetaData,
            TransferSparseValues { .. } => RpcKind::TransferSparseValues,
            NotifyFinishTransfer { .. } => RpcKind::NotifyFinishTransfer,
            TryCombineFetchDenseTable { .. } => RpcKind::TryCombineFetchDenseTable,
            TryFetchSparseMetaData { .. } => RpcKind::TryFetchSparseMetaData,
            TryFetchSparseValues { .. } => RpcKind::TryFetchSparseValues,
            PullDenseTable { .. } => RpcKind::PullDenseTable,
            CombinePullDenseTable { .. } => RpcKind::CombinePullDenseTable,
            PushDenseTable { .. } => RpcKind::PushDenseTable,
            PushPullDenseTable { .. } => RpcKind::PushPullDenseTable,
            PullSparseTable { .. } => RpcKind::PullSparseTable,
            PushSparseTable { .. } => RpcKind::PushSparseTable,
        }
    }
}

/// Minimal metadata about a previously registered model, echoed back to a
/// joiner so it knows what to expect without a separate fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetaData {
    pub name: String,
    pub optim: OptimConfig,
    pub dense_tables: Vec<(u64, String)>,
    pub sparse_tables: Vec<(u64, String, u64, u8)>,
}

/// The reply payload carried under each [`RpcKind`]. Mirrors `RpcRequest`
/// one call at a time rather than matching it variant-for-variant, since a
/// handful of requests (e.g. the two proxy dense-table fetches) share a
/// reply shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcReply {
    TryJoin {
        allow: bool,
        node_id: u64,
        old_router: Router,
        new_router: Router,
        model_initialized: bool,
        model_mdata: Option<ModelMetaData>,
    },
    FetchRouter {
        router: Router,
    },
    InitModel,
    RegisterDenseTable {
        table_id: u64,
    },
    RegisterSparseTable {
        table_id: u64,
    },
    TrySaveModel {
        accepted: bool,
    },
    TryLoadModel {
        accepted: bool,
    },
    IsAllPsWorking {
        all_working: bool,
    },

    Heartbeat {
        status: u8,
    },
    NotifyNodeJoin,
    CreateModel,
    CreateDenseTable,
    CreateSparseTable,
    TriggerSave,
    TriggerLoad {
        mdata: Option<ModelMetaData>,
    },

    TransferDenseTable,
    TransferSparseMetaData,
    TransferSparseValues,
    NotifyFinishTransfer,
    TryCombineFetchDenseTable {
        found: Vec<(u64, String, DenseTensor)>,
    },
    TryFetchSparseMetaData {
        shell: Option<(String, u64, u8, Initializer)>,
    },
    TryFetchSparseValues {
        sparse_ids: Vec<u64>,
        values: Vec<DenseTensor>,
    },

    PullDenseTable {
        value: DenseTensor,
    },
    CombinePullDenseTable {
        values: Vec<(u64, DenseTensor)>,
    },
    PushDenseTable,
    PushPullDenseTable {
        value: DenseTensor,
    },
    PullSparseTable {
        values: Vec<DenseTensor>,
    },
    PushSparseTable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_its_numeric_value() {
        for v in 1..=28u32 {
            let kind = RpcKind::from_u32(v).expect("every id 1..=28 is assigned");
            assert_eq!(kind as u32, v);
        }
        assert!(RpcKind::from_u32(0).is_none());
        assert!(RpcKind::from_u32(29).is_none());
    }

    #[test]
    fn request_kind_matches_catalogue() {
        let r = RpcRequest::TryJoin {
            addr: "127.0.0.1:9000".into(),
        };
        assert_eq!(r.kind() as u32, RpcKind::TryJoin as u32);
    }
}
