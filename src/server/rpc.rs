//! Outbound peer RPC helpers
//!
//! One connect per call, like the rest of the internal plumbing; peers
//! are few and the transport layer pools nothing. Failures surface as
//! `Error::Transport` and are handled by the caller's retry policy.

use crate::common::{Error, Result};
use crate::proto::lockstep_node_client::LockstepNodeClient;
use crate::proto::*;
use tonic::transport::Channel;

async fn connect(peer_addr: &str) -> Result<LockstepNodeClient<Channel>> {
    LockstepNodeClient::connect(format!("http://{}", peer_addr))
        .await
        .map_err(|e| Error::Transport(format!("connect {}: {}", peer_addr, e)))
}

pub async fn append_entries(
    peer_addr: &str,
    request: AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    let mut client = connect(peer_addr).await?;
    Ok(client.append_entries(request).await?.into_inner())
}

pub async fn vote(peer_addr: &str, request: VoteRequest) -> Result<VoteResponse> {
    let mut client = connect(peer_addr).await?;
    Ok(client.vote(request).await?.into_inner())
}

pub async fn keep_alive(peer_addr: &str, request: KeepAliveRequest) -> Result<KeepAliveResponse> {
    let mut client = connect(peer_addr).await?;
    Ok(client.keep_alive(request).await?.into_inner())
}

pub async fn show_status(peer_addr: &str) -> Result<ShowStatusResponse> {
    let mut client = connect(peer_addr).await?;
    Ok(client.show_status(ShowStatusRequest {}).await?.into_inner())
}

pub async fn clean_binlog(peer_addr: &str, end_index: i64) -> Result<CleanBinlogResponse> {
    let mut client = connect(peer_addr).await?;
    Ok(client
        .clean_binlog(CleanBinlogRequest { end_index })
        .await?
        .into_inner())
}
