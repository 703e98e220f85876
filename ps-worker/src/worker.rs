//! Client-side entry point: per-key routing against a cached [`Router`],
//! fan-out/fan-in for combine-pull and multi-key sparse operations, and a
//! single retry-after-refresh on a stale-routing error.
//!
//! Grounded in `original_source/kraken/worker/emitter.h`'s `Emitter`: one
//! object per training process, holding the scheduler address, the cached
//! router, and (optionally) per-table compression state.

use std::collections::HashMap;

use parking_lot::Mutex;
use ps_errors::{PsError, PsResult};
use ps_router::Router;
use ps_tensor::{DenseTensor, Tensor};
use ps_wire::{RpcReply, RpcRequest};

use crate::cache::RouterCache;
use crate::compress::{DctConfig, DenseBag};
use crate::dispatch::call;

pub struct Worker {
    cache: RouterCache,
    dct: Option<DctConfig>,
    dense_bags: Mutex<HashMap<u64, DenseBag>>,
}

impl Worker {
    pub fn new(scheduler_addr: String, initial_router: Router) -> Self {
        Worker {
            cache: RouterCache::new(scheduler_addr, initial_router),
            dct: None,
            dense_bags: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dct(mut self, life_span: u64, eta: f32) -> Self {
        self.dct = Some(DctConfig { life_span, eta });
        self
    }

    pub async fn refresh_router(&self) -> PsResult<()> {
        self.cache.refresh().await
    }

    fn router_version(&self) -> u64 {
        self.cache.current().version()
    }

    fn owner_addr(&self, owner: u64) -> PsResult<String> {
        self.cache
            .node_addr(owner)
            .ok_or_else(|| PsError::Internal(format!("no address cached for node {owner}")))
    }

    /// Run `req_for(owner_addr, router_version)`, retrying exactly once
    /// (after a router refresh) if the node reports the request as
    /// misrouted or stale.
    async fn call_with_retry(
        &self,
        mut resolve: impl FnMut(&Router) -> PsResult<(String, RpcRequest)>,
    ) -> PsResult<RpcReply> {
        let router = self.cache.current();
        let (addr, req) = resolve(&router)?;
        match call(&addr, req.clone()).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_retryable_routing_error() => {
                self.cache.refresh().await?;
                let router = self.cache.current();
                let (addr, req) = resolve(&router)?;
                call(&addr, req).await
            }
            Err(e) => Err(e),
        }
    }

    /// Run `op` against the currently cached router; on a retryable routing
    /// error, refresh the cache once and run `op` again against the
    /// refreshed router. Unlike `call_with_retry`, `op` may fan out to
    /// several owners itself (combine-pull, multi-row sparse pull/push), so
    /// it returns the whole batch's result rather than a single `RpcReply`.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> PsResult<T>
    where
        F: FnMut(Router) -> Fut,
        Fut: std::future::Future<Output = PsResult<T>>,
    {
        match op(self.cache.current()).await {
            Err(e) if e.is_retryable_routing_error() => {
                self.cache.refresh().await?;
                op(self.cache.current()).await
            }
            other => other,
        }
    }

    pub async fn pull_dense(&self, table_id: u64) -> PsResult<DenseTensor> {
        let reply = self
            .call_with_retry(|router| {
                let owner = router.hit_dense(table_id).ok_or(PsError::TableNotExist(table_id))?;
                let addr = router
                    .node(owner)
                    .map(|n| n.name.clone())
                    .ok_or_else(|| PsError::Internal(format!("no address for node {owner}")))?;
                Ok((addr, RpcRequest::PullDenseTable { table_id, router_version: router.version() }))
            })
            .await?;
        match reply {
            RpcReply::PullDenseTable { value } => Ok(value),
            other => Err(unexpected_reply("PullDenseTable", &other)),
        }
    }

    /// Fan a batch of table ids out to each owning node's `CombinePullDenseTable`
    /// and fan the per-node replies back in, preserving no particular order
    /// (callers index by table id).
    pub async fn combine_pull_dense(&self, table_ids: &[u64]) -> PsResult<Vec<(u64, DenseTensor)>> {
        self.with_retry(|router| async move {
            let mut by_owner: HashMap<u64, Vec<u64>> = HashMap::new();
            for &id in table_ids {
                let owner = router.hit_dense(id).ok_or(PsError::TableNotExist(id))?;
                by_owner.entry(owner).or_default().push(id);
            }

            let mut out = Vec::with_capacity(table_ids.len());
            for (owner, ids) in by_owner {
                let addr = self.owner_addr(owner)?;
                let req = RpcRequest::CombinePullDenseTable { table_ids: ids, router_version: router.version() };
                match call(&addr, req).await? {
                    RpcReply::CombinePullDenseTable { values } => out.extend(values),
                    other => return Err(unexpected_reply("CombinePullDenseTable", &other)),
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn push_dense(&self, table_id: u64, grad: DenseTensor, lr: f32) -> PsResult<()> {
        let wire_grad = self.compress(table_id, &grad);
        let reply = self
            .call_with_retry(|router| {
                let owner = router.hit_dense(table_id).ok_or(PsError::TableNotExist(table_id))?;
                let addr = router
                    .node(owner)
                    .map(|n| n.name.clone())
                    .ok_or_else(|| PsError::Internal(format!("no address for node {owner}")))?;
                Ok((
                    addr,
                    RpcRequest::PushDenseTable {
                        table_id,
                        grad: wire_grad.clone(),
                        lr,
                        router_version: router.version(),
                    },
                ))
            })
            .await?;
        match reply {
            RpcReply::PushDenseTable => Ok(()),
            other => Err(unexpected_reply("PushDenseTable", &other)),
        }
    }

    pub async fn push_pull_dense(&self, table_id: u64, grad: DenseTensor, lr: f32) -> PsResult<DenseTensor> {
        let wire_grad = self.compress(table_id, &grad);
        let reply = self
            .call_with_retry(|router| {
                let owner = router.hit_dense(table_id).ok_or(PsError::TableNotExist(table_id))?;
                let addr = router
                    .node(owner)
                    .map(|n| n.name.clone())
                    .ok_or_else(|| PsError::Internal(format!("no address for node {owner}")))?;
                Ok((
                    addr,
                    RpcRequest::PushPullDenseTable {
                        table_id,
                        grad: wire_grad.clone(),
                        lr,
                        router_version: router.version(),
                    },
                ))
            })
            .await?;
        match reply {
            RpcReply::PushPullDenseTable { value } => Ok(value),
            other => Err(unexpected_reply("PushPullDenseTable", &other)),
        }
    }

    /// Sparse rows route independently of one another (`hit_sparse` mixes
    /// `table_id` with each row's own id), so a multi-row pull/push can land
    /// on several different nodes even for one table.
    pub async fn pull_sparse(&self, table_id: u64, sparse_ids: Vec<u64>) -> PsResult<Vec<DenseTensor>> {
        let sparse_ids = &sparse_ids;
        self.with_retry(|router| async move {
            let mut by_owner: HashMap<u64, Vec<(usize, u64)>> = HashMap::new();
            for (pos, &id) in sparse_ids.iter().enumerate() {
                let owner = router.hit_sparse(table_id, id).ok_or(PsError::TableNotExist(table_id))?;
                by_owner.entry(owner).or_default().push((pos, id));
            }

            let mut out: Vec<Option<DenseTensor>> = vec![None; sparse_ids.len()];
            for (owner, rows) in by_owner {
                let addr = self.owner_addr(owner)?;
                let ids: Vec<u64> = rows.iter().map(|(_, id)| *id).collect();
                let req = RpcRequest::PullSparseTable { table_id, sparse_ids: ids, router_version: router.version() };
                match call(&addr, req).await? {
                    RpcReply::PullSparseTable { values } => {
                        for ((pos, _), value) in rows.into_iter().zip(values) {
                            out[pos] = Some(value);
                        }
                    }
                    other => return Err(unexpected_reply("PullSparseTable", &other)),
                }
            }
            Ok(out.into_iter().map(|v| v.expect("every requested row was answered by its owner")).collect())
        })
        .await
    }

    pub async fn push_sparse(&self, table_id: u64, sparse_ids: Vec<u64>, grads: Vec<Tensor>, lr: f32) -> PsResult<()> {
        let sparse_ids = &sparse_ids;
        let grads = &grads;
        self.with_retry(|router| async move {
            let mut by_owner: HashMap<u64, Vec<(u64, Tensor)>> = HashMap::new();
            for (id, grad) in sparse_ids.iter().cloned().zip(grads.iter().cloned()) {
                let owner = router.hit_sparse(table_id, id).ok_or(PsError::TableNotExist(table_id))?;
                by_owner.entry(owner).or_default().push((id, grad));
            }

            for (owner, rows) in by_owner {
                let addr = self.owner_addr(owner)?;
                let (ids, grads): (Vec<u64>, Vec<Tensor>) = rows.into_iter().unzip();
                let req = RpcRequest::PushSparseTable {
                    table_id,
                    sparse_ids: ids,
                    grads,
                    lr,
                    router_version: router.version(),
                };
                match call(&addr, req).await? {
                    RpcReply::PushSparseTable => {}
                    other => return Err(unexpected_reply("PushSparseTable", &other)),
                }
            }
            Ok(())
        })
        .await
    }

    fn compress(&self, table_id: u64, grad: &DenseTensor) -> Tensor {
        let Some(cfg) = &self.dct else {
            return Tensor::Dense(grad.clone());
        };
        let mut bags = self.dense_bags.lock();
        let bag = bags.entry(table_id).or_insert_with(|| DenseBag::new(grad));
        bag.maybe_to_coo(cfg, grad)
    }
}

fn unexpected_reply(expected: &str, got: &RpcReply) -> PsError {
    PsError::Internal(format!("expected a {expected} reply, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_addr_reports_missing_node() {
        let worker = Worker::new("127.0.0.1:9000".into(), Router::new());
        assert!(worker.owner_addr(5).is_err());
    }

    #[test]
    fn router_version_reflects_cached_router() {
        let mut r = Router::new();
        r.add(0, "127.0.0.1:9100".into());
        let v = r.version();
        let worker = Worker::new("127.0.0.1:9000".into(), r);
        assert_eq!(worker.router_version(), v);
    }
}
