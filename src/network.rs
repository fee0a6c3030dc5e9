//! The network transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::InstallRequest;
use crate::raft::InstallResponse;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::ServerId;

/// The transport used by the core to reach its peers.
///
/// Implementations own connection management; the core only submits messages. An `Err`
/// from any method is a transport failure and is retried by the replicator with back-off;
/// protocol-level rejections travel inside the `Ok` responses.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendRequest to the target server.
    async fn send_append(&self, target: ServerId, rpc: AppendRequest) -> Result<AppendResponse>;

    /// Send a VoteRequest to the target server.
    async fn send_vote(&self, target: ServerId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a PollRequest (pre-vote) to the target server.
    async fn send_poll(&self, target: ServerId, rpc: PollRequest) -> Result<PollResponse>;

    /// Send a chunk of a snapshot to the target server.
    async fn send_install(&self, target: ServerId, rpc: InstallRequest) -> Result<InstallResponse>;

    /// Send a ConfigureRequest to the target server.
    async fn send_configure(&self, target: ServerId, rpc: ConfigureRequest) -> Result<ConfigureResponse>;
}
