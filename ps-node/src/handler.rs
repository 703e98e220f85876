//! Translate an incoming [`RpcRequest`] into a [`PsNode`] mutation or query,
//! spawning the donor transfer loop and retrying a serving miss through the
//! proxy set where the protocol calls for it. Mirrors
//! `ps_scheduler::handler`'s shape one level down the stack.

use std::sync::Arc;

use ps_errors::{PsError, PsResult};
use ps_tensor::ElementType;
use ps_wire::{RpcReply, RpcRequest};

use crate::checkpoint;
use crate::node::PsNode;
use crate::transfer;

fn element_type_from_byte(b: u8) -> ElementType {
    match b {
        1 => ElementType::F64,
        2 => ElementType::I32,
        3 => ElementType::I64,
        _ => ElementType::F32,
    }
}

/// Find the node id present in `new_router` but absent from `node`'s
/// current router: the joiner a `NotifyNodeJoin` broadcast concerns. The
/// wire message itself carries only the new router (see
/// `ps_scheduler::dispatch::broadcast_node_join`), so every incumbent
/// derives the joiner's id the same way.
fn joined_id(node: &PsNode, new_router: &ps_router::Router) -> PsResult<u64> {
    let current = node.router();
    new_router
        .nodes()
        .keys()
        .find(|id| !current.contains(**id))
        .copied()
        .ok_or_else(|| PsError::Internal("NotifyNodeJoin carried no new node id".into()))
}

pub async fn handle(node: &Arc<PsNode>, req: RpcRequest) -> PsResult<RpcReply> {
    match req {
        RpcRequest::CreateModel { name, optim } => {
            node.create_model(name, optim)?;
            Ok(RpcReply::CreateModel)
        }
        RpcRequest::CreateDenseTable { table_id, name, val_template } => {
            node.create_dense_table(table_id, name, val_template)?;
            Ok(RpcReply::CreateDenseTable)
        }
        RpcRequest::CreateSparseTable { table_id, name, dimension, element_type, init_spec } => {
            node.create_sparse_table(table_id, name, dimension, element_type_from_byte(element_type), init_spec)?;
            Ok(RpcReply::CreateSparseTable)
        }
        RpcRequest::Heartbeat => Ok(RpcReply::Heartbeat { status: node.status_bits() }),
        RpcRequest::TriggerSave { timestamp } => {
            node.begin_save()?;
            Arc::clone(node).enqueue_save(timestamp);
            Ok(RpcReply::TriggerSave)
        }
        RpcRequest::TriggerLoad => {
            node.begin_load()?;
            let node2 = Arc::clone(node);
            let outcome = tokio::task::spawn_blocking(move || checkpoint::run_load(&node2)).await;
            node.finish_load();
            let mdata = outcome.map_err(|e| PsError::Internal(e.to_string()))??;
            Ok(RpcReply::TriggerLoad { mdata })
        }
        RpcRequest::NotifyNodeJoin { router: new_router } => {
            let joiner = joined_id(node, &new_router)?;
            let is_donor = node.apply_notify_node_join(joiner, new_router)?;
            if is_donor {
                let Some(addr) = node.router().node(joiner).map(|n| n.name.clone()) else {
                    return Err(PsError::Internal(format!("no address for joining node {joiner}")));
                };
                let node = Arc::clone(node);
                tokio::spawn(transfer::run_donor_transfer(node, joiner, addr));
            }
            Ok(RpcReply::NotifyNodeJoin)
        }

        RpcRequest::TransferDenseTable { table_id, name, value } => {
            node.receive_dense(table_id, name, value)?;
            Ok(RpcReply::TransferDenseTable)
        }
        RpcRequest::TransferSparseMetaData { table_id, name, dimension, element_type, init_spec } => {
            node.receive_sparse_meta(table_id, name, dimension, element_type_from_byte(element_type), init_spec)?;
            Ok(RpcReply::TransferSparseMetaData)
        }
        RpcRequest::TransferSparseValues { table_id, sparse_ids, values } => {
            node.receive_sparse_rows(table_id, &sparse_ids, &values)?;
            Ok(RpcReply::TransferSparseValues)
        }
        RpcRequest::NotifyFinishTransfer { donor_id } => {
            node.notify_finish_transfer(donor_id);
            Ok(RpcReply::NotifyFinishTransfer)
        }
        RpcRequest::TryCombineFetchDenseTable { table_ids } => {
            let found = table_ids
                .into_iter()
                .filter_map(|id| node.dense_table_snapshot(id).map(|(name, value)| (id, name, value)))
                .collect();
            Ok(RpcReply::TryCombineFetchDenseTable { found })
        }
        RpcRequest::TryFetchSparseMetaData { table_id } => {
            let shell = node.sparse_table_shell(table_id).map(|(name, dimension, et, init)| (name, dimension, et as u8, init));
            Ok(RpcReply::TryFetchSparseMetaData { shell })
        }
        RpcRequest::TryFetchSparseValues { table_id, sparse_ids } => {
            let version = node.router_version();
            let mut found_ids = Vec::new();
            let mut values = Vec::new();
            if let Ok(rows) = node.pull_sparse(table_id, &sparse_ids, version) {
                for (id, value) in sparse_ids.into_iter().zip(rows) {
                    found_ids.push(id);
                    values.push(value);
                }
            }
            Ok(RpcReply::TryFetchSparseValues { sparse_ids: found_ids, values })
        }

        RpcRequest::PullDenseTable { table_id, router_version } => {
            if node.is_proxying() {
                let _ = transfer::ensure_dense_present(node, table_id).await;
            }
            node.assert_owns_dense(table_id)?;
            let value = node.pull_dense(table_id, router_version)?;
            Ok(RpcReply::PullDenseTable { value })
        }
        RpcRequest::CombinePullDenseTable { table_ids, router_version } => {
            let mut values = Vec::with_capacity(table_ids.len());
            for table_id in table_ids {
                if node.is_proxying() {
                    let _ = transfer::ensure_dense_present(node, table_id).await;
                }
                node.assert_owns_dense(table_id)?;
                values.push((table_id, node.pull_dense(table_id, router_version)?));
            }
            Ok(RpcReply::CombinePullDenseTable { values })
        }
        RpcRequest::PushDenseTable { table_id, grad, lr, router_version } => {
            node.assert_owns_dense(table_id)?;
            node.push_dense(table_id, &grad, lr, router_version)?;
            Ok(RpcReply::PushDenseTable)
        }
        RpcRequest::PushPullDenseTable { table_id, grad, lr, router_version } => {
            node.assert_owns_dense(table_id)?;
            let value = node.push_pull_dense(table_id, &grad, lr, router_version)?;
            Ok(RpcReply::PushPullDenseTable { value })
        }
        RpcRequest::PullSparseTable { table_id, sparse_ids, router_version } => {
            if node.is_proxying() {
                let _ = transfer::ensure_sparse_present(node, table_id, &sparse_ids).await;
            }
            for &id in &sparse_ids {
                node.assert_owns_sparse(table_id, id)?;
            }
            let values = node.pull_sparse(table_id, &sparse_ids, router_version)?;
            Ok(RpcReply::PullSparseTable { values })
        }
        RpcRequest::PushSparseTable { table_id, sparse_ids, grads, lr, router_version } => {
            for &id in &sparse_ids {
                node.assert_owns_sparse(table_id, id)?;
            }
            node.push_sparse(table_id, &sparse_ids, &grads, lr, router_version)?;
            Ok(RpcReply::PushSparseTable)
        }

        other => Err(PsError::UnSupportEvent(format!("{other:?} is not a node RPC"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_router::Router;
    use ps_tensor::DenseTensor;
    use ps_wire::OptimConfig;

    fn ring_of(names: &[&str]) -> Router {
        let mut r = Router::new();
        for (i, n) in names.iter().enumerate() {
            r.add(i as u64, n.to_string());
        }
        r
    }

    #[tokio::test]
    async fn create_model_then_table_then_serve() {
        let node = Arc::new(PsNode::new(0, "a".into(), ring_of(&["a"]), false));
        handle(&node, RpcRequest::CreateModel { name: "m".into(), optim: OptimConfig { kind: "sgd".into(), params: vec![] } })
            .await
            .unwrap();
        handle(
            &node,
            RpcRequest::CreateDenseTable {
                table_id: 1,
                name: "w".into(),
                val_template: DenseTensor::new(vec![1], ElementType::F32, vec![1.0]),
            },
        )
        .await
        .unwrap();
        let reply = handle(&node, RpcRequest::PullDenseTable { table_id: 1, router_version: node.router_version() })
            .await
            .unwrap();
        match reply {
            RpcReply::PullDenseTable { value } => assert_eq!(value.data, vec![1.0]),
            _ => panic!("wrong reply"),
        }
    }

    #[tokio::test]
    async fn unsupported_rpc_is_rejected() {
        let node = Arc::new(PsNode::new(0, "a".into(), ring_of(&["a"]), false));
        let reply = handle(&node, RpcRequest::TryJoin { addr: "x".into() }).await;
        assert!(matches!(reply, Err(PsError::UnSupportEvent(_))));
    }

    #[tokio::test]
    async fn notify_node_join_derives_the_joiners_id_from_the_router_diff() {
        let node = Arc::new(PsNode::new(0, "a".into(), ring_of(&["a"]), false));
        let mut new_router = ring_of(&["a"]);
        new_router.add(1, "b".into());
        let expected_version = new_router.version();
        handle(&node, RpcRequest::NotifyNodeJoin { router: new_router }).await.unwrap();
        assert_eq!(node.router_version(), expected_version);
    }
}
