//! Translate an incoming [`RpcRequest`] into a `Cluster` mutation plus
//! whatever fan-out it implies, and produce the matching [`RpcReply`].
//! This is the function `ps-scheduler-bin` hands to its connection loop,
//! which turns `Err` into an error reply frame and `Ok` into a normal one.

use std::sync::Arc;

use ps_errors::{PsError, PsResult};
use ps_tensor::ElementType;
use ps_wire::{RpcReply, RpcRequest};

use crate::cluster::Cluster;
use crate::dispatch;

pub async fn handle(cluster: &Arc<Cluster>, req: RpcRequest) -> PsResult<RpcReply> {
    match req {
        RpcRequest::TryJoin { addr } => {
            let outcome = cluster.try_join(addr);
            dispatch::broadcast_node_join(&cluster.node_addrs(), outcome.node_id, &outcome.new_router).await;
            Ok(RpcReply::TryJoin {
                allow: true,
                node_id: outcome.node_id,
                old_router: outcome.old_router,
                new_router: outcome.new_router,
                model_initialized: outcome.model_mdata.is_some(),
                model_mdata: outcome.model_mdata,
            })
        }
        RpcRequest::FetchRouter => Ok(RpcReply::FetchRouter { router: cluster.router() }),
        RpcRequest::InitModel { name, optim } => {
            cluster.init_model(name.clone(), optim.clone())?;
            dispatch::broadcast_create_model(&cluster.node_addrs(), &name, &optim).await;
            Ok(RpcReply::InitModel)
        }
        RpcRequest::RegisterDenseTable { name, val_template } => {
            let table_id = cluster.register_dense_table(name.clone())?;
            dispatch::broadcast_create_dense_table(&cluster.node_addrs(), table_id, &name, &val_template).await;
            Ok(RpcReply::RegisterDenseTable { table_id })
        }
        RpcRequest::RegisterSparseTable { name, dimension, element_type, init_spec } => {
            let table_id = cluster.register_sparse_table(name.clone(), dimension, element_type)?;
            let et = element_type_from_byte(element_type);
            dispatch::broadcast_create_sparse_table(
                &cluster.node_addrs(),
                table_id,
                &name,
                dimension,
                et,
                &init_spec,
            )
            .await;
            Ok(RpcReply::RegisterSparseTable { table_id })
        }
        RpcRequest::TrySaveModel => {
            if !cluster.try_begin_save() {
                return Ok(RpcReply::TrySaveModel { accepted: false });
            }
            if !cluster.is_all_ps_working() {
                cluster.finish_save();
                return Ok(RpcReply::TrySaveModel { accepted: false });
            }
            let timestamp = ps_checkpoint::format_timestamp(unix_now());
            dispatch::broadcast_trigger_save(&cluster.node_addrs(), &timestamp).await;
            cluster.finish_save();
            Ok(RpcReply::TrySaveModel { accepted: true })
        }
        RpcRequest::TryLoadModel => {
            if !cluster.try_begin_load() {
                return Ok(RpcReply::TryLoadModel { accepted: false });
            }
            if !cluster.is_all_ps_working() {
                cluster.finish_load();
                return Ok(RpcReply::TryLoadModel { accepted: false });
            }
            if let Some(mdata) = dispatch::broadcast_trigger_load(&cluster.node_addrs()).await {
                cluster.restore_model(mdata);
            }
            cluster.finish_load();
            Ok(RpcReply::TryLoadModel { accepted: true })
        }
        RpcRequest::IsAllPsWorking => Ok(RpcReply::IsAllPsWorking { all_working: cluster.is_all_ps_working() }),
        other => Err(PsError::UnSupportEvent(format!("{other:?} is not a scheduler RPC"))),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn element_type_from_byte(b: u8) -> ElementType {
    match b {
        1 => ElementType::F64,
        2 => ElementType::I32,
        3 => ElementType::I64,
        _ => ElementType::F32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_join_always_allows_and_assigns_the_next_id() {
        let cluster = Arc::new(Cluster::new());
        let reply = handle(&cluster, RpcRequest::TryJoin { addr: "127.0.0.1:1".into() }).await.unwrap();
        match reply {
            RpcReply::TryJoin { allow, node_id, .. } => {
                assert!(allow);
                assert_eq!(node_id, 0);
            }
            _ => panic!("wrong reply variant"),
        }
    }

    #[tokio::test]
    async fn unsupported_rpc_is_rejected() {
        let cluster = Arc::new(Cluster::new());
        let reply = handle(&cluster, RpcRequest::PullDenseTable { table_id: 0, router_version: 0 }).await;
        assert!(matches!(reply, Err(PsError::UnSupportEvent(_))));
    }

    #[tokio::test]
    async fn is_all_ps_working_reflects_heartbeats() {
        let cluster = Arc::new(Cluster::new());
        let reply = handle(&cluster, RpcRequest::IsAllPsWorking).await.unwrap();
        assert_eq!(reply, RpcReply::IsAllPsWorking { all_working: false });
    }
}
