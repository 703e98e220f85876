//! `PsNode`: the per-process lifecycle state machine.
//!
//! Lock hierarchy, enforced by acquisition order in every method here:
//! `ps_mu` (identity/router) -> `model_mu` (tables map) -> per-table lock
//! (inside `ps-table`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use ps_checkpoint::SaveQueue;
use ps_errors::{PsError, PsResult};
use ps_router::Router;
use ps_tensor::{DenseTensor, ElementType, Initializer, Tensor};
use ps_wire::OptimConfig;

use crate::model::Model;
use crate::status::{self, NodeStatus};

/// A single parameter-server process's in-memory state.
pub struct PsNode {
    pub node_id: u64,
    pub addr: String,
    status: NodeStatus,
    ps_mu: RwLock<Router>,
    model_mu: RwLock<Option<Model>>,
    /// Ids of predecessors this node still proxies reads through to, while
    /// `Proxy` is set. Emptying this set drops `Proxy`.
    proxy_set: RwLock<HashSet<u64>>,
    save_dir: PathBuf,
    max_save_count: usize,
    save_queue: SaveQueue,
}

impl PsNode {
    /// A freshly starting node, not yet admitted by any router. Checkpoint
    /// config defaults to an empty save directory; call
    /// [`PsNode::with_checkpoint_config`] before this node ever needs to
    /// save or load.
    pub fn new(node_id: u64, addr: String, router: Router, incumbents_present: bool) -> Self {
        let initial = if incumbents_present {
            status::WORK | status::PROXY
        } else {
            status::WORK
        };
        PsNode {
            node_id,
            addr,
            status: NodeStatus::new(initial),
            ps_mu: RwLock::new(router),
            model_mu: RwLock::new(None),
            proxy_set: RwLock::new(HashSet::new()),
            save_dir: PathBuf::new(),
            max_save_count: 3,
            save_queue: SaveQueue::spawn(),
        }
    }

    /// Set this node's checkpoint directory and retention count. Kept
    /// separate from [`PsNode::new`] so the ~4-argument identity constructor
    /// doesn't grow a parameter every existing call site doesn't care about.
    pub fn with_checkpoint_config(mut self, save_dir: PathBuf, max_save_count: usize) -> Self {
        self.save_dir = save_dir;
        self.max_save_count = max_save_count;
        self
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn status_bits(&self) -> u8 {
        self.status.bits()
    }

    pub fn router_version(&self) -> u64 {
        self.ps_mu.read().version()
    }

    /// A cheap snapshot of the current router, used by the transfer/proxy
    /// loops to resolve a peer's address (`Node.name`, per `ps-router`'s
    /// convention of storing the listen address there) without holding
    /// `ps_mu` across an RPC.
    pub fn router(&self) -> Router {
        self.ps_mu.read().clone()
    }

    fn require_status(&self, flag: u8) -> PsResult<()> {
        if self.status.is_exactly(flag) {
            Ok(())
        } else {
            Err(PsError::NodeStatusInappropriate {
                status: self.status.bits(),
            })
        }
    }

    fn check_router_version(&self, caller_version: u64) -> PsResult<u64> {
        let my_version = self.ps_mu.read().version();
        if caller_version != my_version {
            return Err(PsError::RouterVersionMismatch {
                caller: caller_version,
                node: my_version,
            });
        }
        Ok(my_version)
    }

    fn check_owner(&self, owner: Option<u64>) -> PsResult<()> {
        match owner {
            Some(id) if id == self.node_id => Ok(()),
            Some(owner) => Err(PsError::RouteWrongNode { owner }),
            None => Err(PsError::RouteWrongNode { owner: self.node_id }),
        }
    }

    // --- Scheduler -> Node control plane ---

    pub fn create_model(&self, name: String, optim: OptimConfig) -> PsResult<()> {
        let mut model = self.model_mu.write();
        if model.is_some() {
            return Err(PsError::ModelAlreadyCreate);
        }
        *model = Some(Model::new(name, optim)?);
        Ok(())
    }

    pub fn create_dense_table(
        &self,
        table_id: u64,
        name: String,
        val_template: DenseTensor,
    ) -> PsResult<()> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        model.create_dense_table(table_id, name, val_template)
    }

    pub fn create_sparse_table(
        &self,
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: ElementType,
        init_spec: Initializer,
    ) -> PsResult<()> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        model.create_sparse_table(table_id, name, dimension, element_type, init_spec)
    }

    /// Apply `NotifyNodeJoin`: require exact `Work`, swap in `new_router`,
    /// and report whether this node is a donor for the joiner (true iff any
    /// of the joiner's vnode hashes hit this node under `old_router`).
    pub fn apply_notify_node_join(&self, joined_id: u64, new_router: Router) -> PsResult<bool> {
        self.require_status(status::WORK)?;
        let mut router = self.ps_mu.write();
        let old_router = router.clone();
        let is_donor = new_router
            .node_hash_ranges(joined_id)
            .iter()
            .any(|range| old_router.intersect_nodes(std::slice::from_ref(range)).contains(&self.node_id));
        *router = new_router;
        if is_donor {
            self.status.set(status::TRANSFER);
        }
        Ok(is_donor)
    }

    pub fn finish_transfer(&self) {
        self.status.clear(status::TRANSFER);
    }

    /// Compute this (joining) node's proxy set: for each of its own vnode
    /// hashes, the node `old_router` would have routed it to.
    pub fn compute_proxy_set(&self, old_router: &Router) -> HashSet<u64> {
        let router = self.ps_mu.read();
        let my_ranges = router.node_hash_ranges(self.node_id);
        old_router.intersect_nodes(&my_ranges)
    }

    pub fn set_proxy_set(&self, set: HashSet<u64>) {
        let is_empty = set.is_empty();
        *self.proxy_set.write() = set;
        if is_empty {
            self.status.clear(status::PROXY);
        } else {
            self.status.set(status::PROXY);
        }
    }

    /// Record that `from_node_id` finished transferring to us; drop `Proxy`
    /// once every predecessor has reported in.
    pub fn notify_finish_transfer(&self, from_node_id: u64) {
        let mut set = self.proxy_set.write();
        set.remove(&from_node_id);
        if set.is_empty() {
            self.status.clear(status::PROXY);
        }
    }

    pub fn is_proxying(&self) -> bool {
        self.status.has(status::PROXY)
    }

    pub fn proxy_targets(&self) -> HashSet<u64> {
        self.proxy_set.read().clone()
    }

    // --- Checkpoint (save/load) ---

    /// Acquire `Save`, refusing unless status is exactly `Work`.
    pub fn begin_save(&self) -> PsResult<()> {
        self.require_status(status::WORK)?;
        self.status.set(status::SAVE);
        Ok(())
    }

    pub fn finish_save(&self) {
        self.status.clear(status::SAVE);
    }

    /// Enqueue a snapshot write for `timestamp` on the background save
    /// queue; `finish_save` runs once the job completes or fails. Returns
    /// `false` only if the queue's worker has already exited.
    pub fn enqueue_save(self: std::sync::Arc<Self>, timestamp: String) -> bool {
        let node = std::sync::Arc::clone(&self);
        self.save_queue.enqueue(move || {
            if let Err(e) = node.write_snapshot(&timestamp) {
                tracing::warn!(error = %e, node_id = node.node_id, "checkpoint save failed");
            }
            node.finish_save();
        })
    }

    /// Synchronous snapshot write: router, model metadata, and every table
    /// this node currently holds, to `<save_dir>/shard_<node_id>/<timestamp>/`.
    /// Runs on the save queue's blocking worker, never on a serving task.
    fn write_snapshot(&self, timestamp: &str) -> PsResult<()> {
        let router = self.router();
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        let mdata = model.to_metadata();
        let dense_tables: Vec<&ps_table::DenseTable> = model.dense.values().collect();
        let sparse_tables: Vec<&ps_table::SparseTable> = model.sparse.values().collect();
        ps_checkpoint::write_snapshot(
            &self.save_dir,
            self.node_id,
            timestamp,
            &router,
            &mdata,
            &dense_tables,
            &sparse_tables,
            self.max_save_count,
        )
    }

    /// Acquire `Load`, refusing unless status is exactly `Work`.
    pub fn begin_load(&self) -> PsResult<()> {
        self.require_status(status::WORK)?;
        self.status.set(status::LOAD);
        Ok(())
    }

    pub fn finish_load(&self) {
        self.status.clear(status::LOAD);
    }

    // --- Transfer (donor -> joiner streaming) ---

    pub fn dense_table_ids(&self) -> Vec<u64> {
        self.model_mu.read().as_ref().map(|m| m.dense.keys().copied().collect()).unwrap_or_default()
    }

    pub fn sparse_table_ids(&self) -> Vec<u64> {
        self.model_mu.read().as_ref().map(|m| m.sparse.keys().copied().collect()).unwrap_or_default()
    }

    pub fn dense_table_snapshot(&self, table_id: u64) -> Option<(String, DenseTensor)> {
        self.model_mu.read().as_ref()?.dense.get(&table_id).map(|t| (t.name.clone(), t.pull()))
    }

    pub fn sparse_table_shell(&self, table_id: u64) -> Option<(String, u64, ElementType, Initializer)> {
        self.model_mu
            .read()
            .as_ref()?
            .sparse
            .get(&table_id)
            .map(|t| (t.name.clone(), t.dimension, t.element_type, t.init_spec.clone()))
    }

    pub fn sparse_slot_count(&self, table_id: u64) -> Option<usize> {
        self.model_mu.read().as_ref()?.sparse.get(&table_id).map(|t| t.slot_count())
    }

    /// One donor-iteration batch: up to `batch_size` rows of `table_id`'s
    /// slot `slot_idx` at or after `cursor`.
    pub fn sparse_batch(&self, table_id: u64, slot_idx: usize, cursor: u64, batch_size: usize) -> Vec<(u64, DenseTensor)> {
        self.model_mu
            .read()
            .as_ref()
            .and_then(|m| m.sparse.get(&table_id))
            .map(|t| t.batch_from(slot_idx, cursor, batch_size))
            .unwrap_or_default()
    }

    /// Drop dense tables this node no longer owns under its current router,
    /// run by the donor after a successful transfer.
    pub fn drop_unowned_dense(&self) {
        let router = self.ps_mu.read().clone();
        let mut guard = self.model_mu.write();
        if let Some(model) = guard.as_mut() {
            model.dense.retain(|&id, _| router.hit_dense(id) == Some(self.node_id));
        }
    }

    /// Drop sparse rows of `table_id` this node no longer owns under its
    /// current router, run by the donor after a successful transfer.
    pub fn drop_unowned_sparse_rows(&self, table_id: u64) {
        let router = self.ps_mu.read().clone();
        let guard = self.model_mu.read();
        let Some(model) = guard.as_ref() else { return };
        let Some(table) = model.sparse.get(&table_id) else { return };
        for slot in 0..table.slot_count() {
            table.retain_slot(slot, |id| router.hit_sparse(table_id, id) == Some(self.node_id));
        }
    }

    // --- Transfer (inbound, joiner side) and proxy read-through ---

    pub fn has_dense(&self, table_id: u64) -> bool {
        self.model_mu.read().as_ref().map_or(false, |m| m.dense.contains_key(&table_id))
    }

    pub fn has_sparse_table(&self, table_id: u64) -> bool {
        self.model_mu.read().as_ref().map_or(false, |m| m.sparse.contains_key(&table_id))
    }

    pub fn has_sparse_row(&self, table_id: u64, sparse_id: u64) -> bool {
        self.model_mu
            .read()
            .as_ref()
            .and_then(|m| m.sparse.get(&table_id))
            .map_or(false, |t| t.contains(sparse_id))
    }

    /// Insert-only-if-absent, matching `TransferDenseTable`'s idempotency
    /// requirement (first insert wins between a donor's push and the
    /// joiner's own proxy-fetch).
    pub fn receive_dense(&self, table_id: u64, name: String, value: DenseTensor) -> PsResult<()> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        if !model.dense.contains_key(&table_id) {
            model.dense.insert(table_id, ps_table::DenseTable::new(table_id, name, value));
        }
        Ok(())
    }

    pub fn receive_sparse_meta(
        &self,
        table_id: u64,
        name: String,
        dimension: u64,
        element_type: ElementType,
        init_spec: Initializer,
    ) -> PsResult<()> {
        let mut guard = self.model_mu.write();
        let model = guard.as_mut().ok_or(PsError::ModelNotInitialized)?;
        if !model.sparse.contains_key(&table_id) {
            model
                .sparse
                .insert(table_id, ps_table::SparseTable::new(table_id, name, dimension, element_type, init_spec));
        }
        Ok(())
    }

    pub fn receive_sparse_rows(&self, table_id: u64, sparse_ids: &[u64], values: &[DenseTensor]) -> PsResult<()> {
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        model.sparse_table(table_id)?.insert(sparse_ids, values);
        Ok(())
    }

    // --- Serving paths ---

    pub fn pull_dense(&self, table_id: u64, router_version: u64) -> PsResult<DenseTensor> {
        self.check_router_version(router_version)?;
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        Ok(model.dense_table(table_id)?.pull())
    }

    pub fn push_dense(&self, table_id: u64, grad: &Tensor, lr: f32, router_version: u64) -> PsResult<()> {
        self.check_router_version(router_version)?;
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        model.dense_table(table_id)?.push(grad, lr, &model.optim)
    }

    pub fn push_pull_dense(
        &self,
        table_id: u64,
        grad: &Tensor,
        lr: f32,
        router_version: u64,
    ) -> PsResult<DenseTensor> {
        self.check_router_version(router_version)?;
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        model.dense_table(table_id)?.push_pull(grad, lr, &model.optim)
    }

    pub fn pull_sparse(
        &self,
        table_id: u64,
        sparse_ids: &[u64],
        router_version: u64,
    ) -> PsResult<Vec<DenseTensor>> {
        self.check_router_version(router_version)?;
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        Ok(model.sparse_table(table_id)?.pull(sparse_ids))
    }

    pub fn push_sparse(
        &self,
        table_id: u64,
        sparse_ids: &[u64],
        grads: &[Tensor],
        lr: f32,
        router_version: u64,
    ) -> PsResult<()> {
        self.check_router_version(router_version)?;
        let guard = self.model_mu.read();
        let model = guard.as_ref().ok_or(PsError::ModelNotInitialized)?;
        model.sparse_table(table_id)?.push(sparse_ids, grads, lr, &model.optim)
    }

    /// Confirm that `table_id`'s dense key hashes to this node under the
    /// current router, returning `RouteWrongNode` otherwise. Serving
    /// handlers call this before `pull_dense`/`push_dense` when the caller
    /// hasn't already resolved ownership itself.
    pub fn assert_owns_dense(&self, table_id: u64) -> PsResult<()> {
        let owner = self.ps_mu.read().hit_dense(table_id);
        self.check_owner(owner)
    }

    pub fn assert_owns_sparse(&self, table_id: u64, sparse_id: u64) -> PsResult<()> {
        let owner = self.ps_mu.read().hit_sparse(table_id, sparse_id);
        self.check_owner(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(names: &[&str]) -> Router {
        let mut r = Router::new();
        for (i, n) in names.iter().enumerate() {
            r.add(i as u64, n.to_string());
        }
        r
    }

    #[test]
    fn serving_rejects_stale_router_version() {
        let router = ring_of(&["a"]);
        let node = PsNode::new(0, "a".into(), router, false);
        node.create_model(
            "m".into(),
            OptimConfig {
                kind: "sgd".into(),
                params: vec![],
            },
        )
        .unwrap();
        node.create_dense_table(
            1,
            "w".into(),
            DenseTensor::new(vec![1], ElementType::F32, vec![0.0]),
        )
        .unwrap();
        assert!(node.pull_dense(1, 0).is_ok());
        assert_eq!(
            node.pull_dense(1, 99),
            Err(PsError::RouterVersionMismatch { caller: 99, node: 1 })
        );
    }

    #[test]
    fn notify_node_join_requires_exact_work_status() {
        let router = ring_of(&["a"]);
        let node = PsNode::new(0, "a".into(), router.clone(), false);
        node.status.set(status::SAVE);
        let mut new_router = router;
        new_router.add(1, "b".into());
        assert!(matches!(
            node.apply_notify_node_join(1, new_router),
            Err(PsError::NodeStatusInappropriate { .. })
        ));
    }

    #[test]
    fn proxy_drops_once_every_predecessor_reports_in() {
        let router = ring_of(&["a", "b"]);
        let node = PsNode::new(2, "c".into(), router, false);
        let mut set = HashSet::new();
        set.insert(0u64);
        set.insert(1u64);
        node.set_proxy_set(set);
        assert!(node.is_proxying());
        node.notify_finish_transfer(0);
        assert!(node.is_proxying());
        node.notify_finish_transfer(1);
        assert!(!node.is_proxying());
    }

    #[test]
    fn receive_dense_is_insert_only_if_absent() {
        let node = PsNode::new(0, "a".into(), ring_of(&["a"]), false);
        node.create_model("m".into(), OptimConfig { kind: "sgd".into(), params: vec![] }).unwrap();
        node.receive_dense(1, "w".into(), DenseTensor::new(vec![1], ElementType::F32, vec![1.0])).unwrap();
        // A later write for the same table_id, as would arrive from a concurrent
        // proxy-fetch racing the donor transfer, must not clobber the first.
        node.receive_dense(1, "w".into(), DenseTensor::new(vec![1], ElementType::F32, vec![2.0])).unwrap();
        assert_eq!(node.pull_dense(1, node.router_version()).unwrap().data, vec![1.0]);
    }

    #[test]
    fn receive_dense_requires_a_model() {
        let node = PsNode::new(0, "a".into(), ring_of(&["a"]), false);
        assert!(matches!(
            node.receive_dense(1, "w".into(), DenseTensor::new(vec![1], ElementType::F32, vec![1.0])),
            Err(PsError::ModelNotInitialized)
        ));
    }

    #[test]
    fn has_dense_and_has_sparse_row_reflect_presence() {
        let node = PsNode::new(0, "a".into(), ring_of(&["a"]), false);
        node.create_model("m".into(), OptimConfig { kind: "sgd".into(), params: vec![] }).unwrap();
        assert!(!node.has_dense(1));
        node.create_dense_table(1, "w".into(), DenseTensor::new(vec![1], ElementType::F32, vec![0.0])).unwrap();
        assert!(node.has_dense(1));

        assert!(!node.has_sparse_row(2, 7));
        node.create_sparse_table(2, "emb".into(), 4, ElementType::F32, Initializer::Constant(0.0)).unwrap();
        assert!(!node.has_sparse_row(2, 7));
        node.receive_sparse_rows(2, &[7], &[DenseTensor::new(vec![4], ElementType::F32, vec![0.0; 4])]).unwrap();
        assert!(node.has_sparse_row(2, 7));
    }

    #[test]
    fn drop_unowned_dense_keeps_only_tables_this_node_still_routes_to() {
        // `node_id` 99 is absent from the router, so every table this node
        // holds is unowned under it regardless of how the hash ring lands.
        let node = PsNode::new(99, "ghost".into(), ring_of(&["a", "b"]), false);
        node.create_model("m".into(), OptimConfig { kind: "sgd".into(), params: vec![] }).unwrap();
        node.create_dense_table(1, "w".into(), DenseTensor::new(vec![1], ElementType::F32, vec![0.0])).unwrap();
        assert!(node.has_dense(1));
        node.drop_unowned_dense();
        assert!(!node.has_dense(1));
    }

    #[test]
    fn drop_unowned_sparse_rows_keeps_only_rows_this_node_still_routes_to() {
        let node = PsNode::new(99, "ghost".into(), ring_of(&["a", "b"]), false);
        node.create_model("m".into(), OptimConfig { kind: "sgd".into(), params: vec![] }).unwrap();
        node.create_sparse_table(1, "emb".into(), 2, ElementType::F32, Initializer::Constant(0.0)).unwrap();
        node.receive_sparse_rows(1, &[3, 4], &[
            DenseTensor::new(vec![2], ElementType::F32, vec![0.0, 0.0]),
            DenseTensor::new(vec![2], ElementType::F32, vec![1.0, 1.0]),
        ])
        .unwrap();
        assert!(node.has_sparse_row(1, 3));
        node.drop_unowned_sparse_rows(1);
        assert!(!node.has_sparse_row(1, 3));
        assert!(!node.has_sparse_row(1, 4));
    }
}
