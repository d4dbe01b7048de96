//! gRPC surface of a node
//!
//! Thin translation layer: every method hands the request to the node
//! and wraps whatever comes back. Redirects, safe-mode rejections and
//! expired uuids are ordinary response fields, not transport errors.

use crate::common::Result;
use crate::proto::lockstep_node_server::{LockstepNode, LockstepNodeServer};
use crate::proto::*;
use crate::server::node::Node;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct LockstepGrpcService {
    node: Arc<Node>,
}

impl LockstepGrpcService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> LockstepNodeServer<Self> {
        LockstepNodeServer::new(self)
    }
}

#[tonic::async_trait]
impl LockstepNode for LockstepGrpcService {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> std::result::Result<Response<AppendEntriesResponse>, Status> {
        let reply = self.node.handle_append_entries(request.into_inner()).await;
        Ok(Response::new(reply))
    }

    async fn vote(
        &self,
        request: Request<VoteRequest>,
    ) -> std::result::Result<Response<VoteResponse>, Status> {
        Ok(Response::new(self.node.handle_vote(request.into_inner())))
    }

    async fn put(
        &self,
        request: Request<PutRequest>,
    ) -> std::result::Result<Response<PutResponse>, Status> {
        Ok(Response::new(self.node.put(request.into_inner()).await))
    }

    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> std::result::Result<Response<GetResponse>, Status> {
        Ok(Response::new(self.node.get(request.into_inner()).await))
    }

    async fn delete(
        &self,
        request: Request<DelRequest>,
    ) -> std::result::Result<Response<DelResponse>, Status> {
        Ok(Response::new(self.node.delete(request.into_inner()).await))
    }

    async fn scan(
        &self,
        request: Request<ScanRequest>,
    ) -> std::result::Result<Response<ScanResponse>, Status> {
        Ok(Response::new(self.node.scan(request.into_inner())))
    }

    async fn lock(
        &self,
        request: Request<LockRequest>,
    ) -> std::result::Result<Response<LockResponse>, Status> {
        Ok(Response::new(self.node.lock(request.into_inner()).await))
    }

    async fn unlock(
        &self,
        request: Request<UnlockRequest>,
    ) -> std::result::Result<Response<UnlockResponse>, Status> {
        Ok(Response::new(self.node.unlock(request.into_inner()).await))
    }

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> std::result::Result<Response<WatchResponse>, Status> {
        Ok(Response::new(self.node.watch(request.into_inner()).await))
    }

    async fn keep_alive(
        &self,
        request: Request<KeepAliveRequest>,
    ) -> std::result::Result<Response<KeepAliveResponse>, Status> {
        Ok(Response::new(self.node.keep_alive(request.into_inner())))
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> std::result::Result<Response<LoginResponse>, Status> {
        Ok(Response::new(self.node.login(request.into_inner()).await))
    }

    async fn logout(
        &self,
        request: Request<LogoutRequest>,
    ) -> std::result::Result<Response<LogoutResponse>, Status> {
        Ok(Response::new(self.node.logout(request.into_inner()).await))
    }

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterResponse>, Status> {
        Ok(Response::new(self.node.register(request.into_inner()).await))
    }

    async fn show_status(
        &self,
        _request: Request<ShowStatusRequest>,
    ) -> std::result::Result<Response<ShowStatusResponse>, Status> {
        Ok(Response::new(self.node.show_status()))
    }

    async fn clean_binlog(
        &self,
        request: Request<CleanBinlogRequest>,
    ) -> std::result::Result<Response<CleanBinlogResponse>, Status> {
        Ok(Response::new(self.node.clean_binlog(request.into_inner())))
    }

    async fn rpc_stat(
        &self,
        request: Request<RpcStatRequest>,
    ) -> std::result::Result<Response<RpcStatResponse>, Status> {
        Ok(Response::new(self.node.rpc_stat(request.into_inner())))
    }
}

/// Start background duties and serve the node's endpoint until shutdown
pub async fn serve(node: Arc<Node>) -> Result<()> {
    let addr = node
        .config
        .self_endpoint()
        .parse()
        .map_err(|e| crate::Error::InvalidConfig(format!("bad endpoint: {}", e)))?;
    Node::start(&node);
    tracing::info!(addr = %addr, "serving");
    tonic::transport::Server::builder()
        .add_service(LockstepGrpcService::new(node.clone()).into_server())
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    node.shutdown();
    tracing::info!("server shutdown");
    Ok(())
}
