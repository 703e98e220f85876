//! The scheduler's control-plane state: the canonical [`Router`], the
//! model's metadata, and per-node bookkeeping (address, last known status).
//! Holds no network connections itself — see `crate::dispatch` for fanning
//! decisions made here out to nodes over `ps-wire`.

use std::collections::HashMap;

use parking_lot::RwLock;
use ps_errors::{PsError, PsResult};
use ps_router::Router;
use ps_wire::{ModelMetaData, OptimConfig};

/// What `try_join` decided, for the caller to both reply to the joiner with
/// and use to drive the `NotifyNodeJoin` fan-out to every incumbent.
pub struct JoinOutcome {
    pub node_id: u64,
    pub old_router: Router,
    pub new_router: Router,
    pub model_mdata: Option<ModelMetaData>,
}

#[derive(Default)]
struct ModelState {
    name: String,
    optim: OptimConfig,
    dense_tables: Vec<(u64, String)>,
    sparse_tables: Vec<(u64, String, u64, u8)>,
    next_table_id: u64,
}

impl ModelState {
    fn to_wire(&self) -> ModelMetaData {
        ModelMetaData {
            name: self.name.clone(),
            optim: self.optim.clone(),
            dense_tables: self.dense_tables.clone(),
            sparse_tables: self.sparse_tables.clone(),
        }
    }
}

/// Cluster-wide state the scheduler is the single source of truth for.
/// `ps_mu` here is the scheduler's own router lock, not a node's; it sits at
/// the top of the same lock hierarchy nodes use (router before model).
pub struct Cluster {
    ps_mu: RwLock<Router>,
    model_mu: RwLock<Option<ModelState>>,
    node_addrs: RwLock<HashMap<u64, String>>,
    node_status: RwLock<HashMap<u64, u8>>,
    save_in_progress: RwLock<bool>,
    load_in_progress: RwLock<bool>,
}

impl Default for Cluster {
    fn default() -> Self {
        Cluster {
            ps_mu: RwLock::new(Router::new()),
            model_mu: RwLock::new(None),
            node_addrs: RwLock::new(HashMap::new()),
            node_status: RwLock::new(HashMap::new()),
            save_in_progress: RwLock::new(false),
            load_in_progress: RwLock::new(false),
        }
    }
}

impl Cluster {
    pub fn new() -> Self {
        Cluster::default()
    }

    pub fn router(&self) -> Router {
        self.ps_mu.read().clone()
    }

    pub fn node_addr(&self, id: u64) -> Option<String> {
        self.node_addrs.read().get(&id).cloned()
    }

    pub fn node_addrs(&self) -> HashMap<u64, String> {
        self.node_addrs.read().clone()
    }

    /// Admit `addr` as the next node id, bumping the router. Never rejects
    /// on the router side (id allocation here is always monotone); the
    /// caller decides whether to actually admit based on the reply it gets
    /// back from the joiner's own readiness check, matching `TryJoin`'s
    /// two-phase feel in the protocol's naming.
    pub fn try_join(&self, addr: String) -> JoinOutcome {
        let mut router = self.ps_mu.write();
        let old_router = router.clone();
        let node_id = router.next_node_id();
        let admitted = router.add(node_id, addr.clone());
        debug_assert!(admitted, "next_node_id is always strictly monotone");
        self.node_addrs.write().insert(node_id, addr);
        self.node_status.write().insert(node_id, ps_node_status_init());
        let model_mdata = self.model_mu.read().as_ref().map(ModelState::to_wire);
        JoinOutcome {
            node_id,
            old_router,
            new_router: router.clone(),
            model_mdata,
        }
    }

    pub fn record_heartbeat(&self, node_id: u64, status: u8) {
        self.node_status.write().insert(node_id, status);
    }

    /// True once every admitted node's last-known status is exactly `Work`
    /// (the `IsAllPsWorking` predicate a worker polls before starting a
    /// training step after a membership change).
    pub fn is_all_ps_working(&self) -> bool {
        let statuses = self.node_status.read();
        let router = self.ps_mu.read();
        !router.is_empty()
            && router
                .nodes()
                .keys()
                .all(|id| statuses.get(id).copied() == Some(ps_node_status_work()))
    }

    pub fn init_model(&self, name: String, optim: OptimConfig) -> PsResult<()> {
        let mut model = self.model_mu.write();
        if model.is_some() {
            return Err(PsError::ModelAlreadyCreate);
        }
        *model = Some(ModelState {
            name,
            optim,
            dense_tables: Vec::new(),
            sparse_tables: Vec::new(),
            next_table_id: 0,
        });
        Ok(())
    }

    pub fn model_mdata(&self) -> Option<ModelMetaData> {
        self.model_mu.read().as_ref().map(ModelState::to_wire)
    }

    /// Repopulate model bookkeeping from a node's recovered checkpoint
    /// metadata, once `TryLoadModel` hears back a non-empty reply.
    /// `next_table_id` is derived since the wire metadata only lists the
    /// tables that exist, not the counter that assigned their ids.
    pub fn restore_model(&self, mdata: ModelMetaData) {
        let next_table_id = mdata
            .dense_tables
            .iter()
            .map(|(id, _)| *id)
            .chain(mdata.sparse_tables.iter().map(|(id, ..)| *id))
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        *self.model_mu.write() = Some(ModelState {
            name: mdata.name,
            optim: mdata.optim,
            dense_tables: mdata.dense_tables,
            sparse_tables: mdata.sparse_tables,
            next_table_id,
        });
    }

    /// Record a new dense table and return its assigned id. The caller's
    /// `val_template` isn't stored here (the scheduler only tracks shape of
    /// the catalogue, not table contents); it's echoed straight through to
    /// the `CreateDenseTable` fan-out.
    pub fn register_dense_table(&self, name: String) -> PsResult<u64> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        if model.dense_tables.iter().any(|(_, n)| n == &name) {
            return Err(PsError::TableAlreadyCreate(0));
        }
        let table_id = model.next_table_id;
        model.next_table_id += 1;
        model.dense_tables.push((table_id, name));
        Ok(table_id)
    }

    pub fn register_sparse_table(
        &self,
        name: String,
        dimension: u64,
        element_type: u8,
    ) -> PsResult<u64> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        if model.sparse_tables.iter().any(|(_, n, ..)| n == &name) {
            return Err(PsError::TableAlreadyCreate(0));
        }
        let table_id = model.next_table_id;
        model.next_table_id += 1;
        model.sparse_tables.push((table_id, name, dimension, element_type));
        Ok(table_id)
    }

    /// Gate a save request: only one save runs cluster-wide at a time.
    pub fn try_begin_save(&self) -> bool {
        let mut flag = self.save_in_progress.write();
        if *flag {
            return false;
        }
        *flag = true;
        true
    }

    pub fn finish_save(&self) {
        *self.save_in_progress.write() = false;
    }

    pub fn try_begin_load(&self) -> bool {
        let mut flag = self.load_in_progress.write();
        if *flag {
            return false;
        }
        *flag = true;
        true
    }

    pub fn finish_load(&self) {
        *self.load_in_progress.write() = false;
    }
}

fn ps_node_status_init() -> u8 {
    // `Init`: a node that has just been admitted but hasn't heartbeated yet.
    1 << 0
}

fn ps_node_status_work() -> u8 {
    1 << 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_join_allocates_monotone_ids_and_bumps_the_router() {
        let cluster = Cluster::new();
        let a = cluster.try_join("10.0.0.1:9000".into());
        assert_eq!(a.node_id, 0);
        let b = cluster.try_join("10.0.0.2:9000".into());
        assert_eq!(b.node_id, 1);
        assert_eq!(cluster.router().version(), 2);
        assert_eq!(cluster.node_addr(1).as_deref(), Some("10.0.0.2:9000"));
    }

    #[test]
    fn init_model_twice_is_rejected() {
        let cluster = Cluster::new();
        let optim = OptimConfig { kind: "sgd".into(), params: vec![] };
        cluster.init_model("m".into(), optim.clone()).unwrap();
        assert_eq!(cluster.init_model("m2".into(), optim), Err(PsError::ModelAlreadyCreate));
    }

    #[test]
    fn register_dense_table_assigns_increasing_ids() {
        let cluster = Cluster::new();
        cluster.init_model("m".into(), OptimConfig { kind: "sgd".into(), params: vec![] }).unwrap();
        let id0 = cluster.register_dense_table("w0".into()).unwrap();
        let id1 = cluster.register_dense_table("w1".into()).unwrap();
        assert_eq!((id0, id1), (0, 1));
    }

    #[test]
    fn is_all_ps_working_requires_every_node_to_report_work() {
        let cluster = Cluster::new();
        let a = cluster.try_join("a".into());
        assert!(!cluster.is_all_ps_working());
        cluster.record_heartbeat(a.node_id, ps_node_status_work());
        assert!(cluster.is_all_ps_working());
        cluster.try_join("b".into());
        assert!(!cluster.is_all_ps_working());
    }

    #[test]
    fn only_one_save_runs_at_a_time() {
        let cluster = Cluster::new();
        assert!(cluster.try_begin_save());
        assert!(!cluster.try_begin_save());
        cluster.finish_save();
        assert!(cluster.try_begin_save());
    }
}
