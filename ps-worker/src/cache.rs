//! A router fetched once from the scheduler and refreshed on demand,
//! mirroring `query_status_cache`'s cache-with-background-refresh shape:
//! callers read a cheap clone, and a routing failure triggers an explicit
//! refresh rather than a poll loop.

use parking_lot::RwLock;
use ps_errors::PsResult;
use ps_router::Router;
use ps_wire::RpcReply;
use ps_wire::RpcRequest;

use crate::dispatch::call;

pub struct RouterCache {
    scheduler_addr: String,
    router: RwLock<Router>,
}

impl RouterCache {
    pub fn new(scheduler_addr: String, initial: Router) -> Self {
        RouterCache {
            scheduler_addr,
            router: RwLock::new(initial),
        }
    }

    /// A cheap snapshot of the current router. Callers must not hold this
    /// across a subsequent `refresh` call's await point; clone the owner id
    /// or address they need and drop the snapshot instead.
    pub fn current(&self) -> Router {
        self.router.read().clone()
    }

    /// Re-fetch the router from the scheduler, replacing the cached copy
    /// unconditionally (the scheduler's router is the only source of truth,
    /// so there's nothing to merge).
    pub async fn refresh(&self) -> PsResult<()> {
        let reply = call(&self.scheduler_addr, RpcRequest::FetchRouter).await?;
        let RpcReply::FetchRouter { router } = reply else {
            return Err(ps_errors::PsError::Internal("unexpected reply to FetchRouter".into()));
        };
        *self.router.write() = router;
        Ok(())
    }

    pub fn node_addr(&self, node_id: u64) -> Option<String> {
        self.router.read().node(node_id).map(|n| n.name.clone())
    }
}
