//! Registro de nodos del master y controlador del lado esclavo.

mod admin;
mod controller;
mod downloader;
mod node;
mod pool;

pub use admin::NodeService;
pub use controller::{MasterInfo, SlaveController};
pub use downloader::{
    Aria2Client, DisabledDownloader, DownloadRequest, DownloadStatus, Downloader, GidRequest,
    RemoteDownloader,
};
pub use node::{
    slave_client, HeartbeatPolicy, HeartbeatTransport, MasterNode, Node, RpcTransport, SiteInfo,
    SlaveNode, StatusCallback, TransportFactory,
};
pub use pool::{NodeFactory, NodePool};

use thiserror::Error;

use crate::rpc::RpcError;
use crate::serializer::{
    CODE_FEATURE_DISABLED, CODE_INTERNAL, CODE_INVALID_ACTION_ON_SYSTEM_NODE,
    CODE_MASTER_NOT_FOUND, CODE_NOT_FOUND,
};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown master node id")]
    MasterNotFound,

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("invalid action on system node")]
    SystemNode,

    #[error("feature {0} is not enabled on this node")]
    FeatureDisabled(String),

    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("aria2 rpc error: {0}")]
    Aria2(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClusterError {
    pub fn code(&self) -> i32 {
        match self {
            ClusterError::MasterNotFound => CODE_MASTER_NOT_FOUND,
            ClusterError::NodeNotFound(_) => CODE_NOT_FOUND,
            ClusterError::SystemNode => CODE_INVALID_ACTION_ON_SYSTEM_NODE,
            ClusterError::FeatureDisabled(_) => CODE_FEATURE_DISABLED,
            ClusterError::Rpc(RpcError::Business { code, .. }) => *code,
            ClusterError::Store(StoreError::NotFound { .. }) => CODE_NOT_FOUND,
            _ => CODE_INTERNAL,
        }
    }
}
