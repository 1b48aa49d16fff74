//! Pod-resources gRPC client
//!
//! Talks to the kubelet pod-resources endpoint over a local UNIX socket.
//! Message types are defined manually with prost so no protoc is needed at
//! build time. Stream errors reset the channel and the next call reconnects
//! with exponential backoff.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

pub mod v1 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: Vec<PodResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
        #[prost(message, repeated, tag = "3")]
        pub containers: Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub devices: Vec<ContainerDevices>,
        #[prost(message, repeated, tag = "3")]
        pub resources: Vec<ResourceEntry>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: Vec<String>,
        #[prost(message, optional, tag = "3")]
        pub topology: Option<TopologyInfo>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TopologyInfo {
        #[prost(message, repeated, tag = "1")]
        pub nodes: Vec<NumaNode>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NumaNode {
        #[prost(int64, tag = "1")]
        pub id: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ResourceEntry {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(message, repeated, tag = "2")]
        pub original_topology_aware_quantity_list: Vec<TopologyAwareQuantity>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TopologyAwareQuantity {
        #[prost(double, tag = "1")]
        pub resource_value: f64,
        #[prost(uint64, tag = "2")]
        pub node: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AllocatableResourcesRequest {}

    #[derive(Clone, PartialEq, Message)]
    pub struct AllocatableResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub devices: Vec<ContainerDevices>,
        #[prost(message, repeated, tag = "2")]
        pub resources: Vec<AllocatableTopologyAwareResource>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AllocatableTopologyAwareResource {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(message, repeated, tag = "2")]
        pub capacity_per_numa: Vec<TopologyAwareQuantity>,
        #[prost(message, repeated, tag = "3")]
        pub allocatable_per_numa: Vec<TopologyAwareQuantity>,
    }
}

/// Manual service client, prost codec over the tonic channel
mod lister_client {
    use super::v1::*;
    use tonic::codegen::http;

    #[derive(Debug, Clone)]
    pub struct PodResourcesListerClient {
        inner: tonic::client::Grpc<tonic::transport::Channel>,
    }

    impl PodResourcesListerClient {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        pub async fn list(
            &mut self,
            request: ListPodResourcesRequest,
        ) -> Result<tonic::Response<ListPodResourcesResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("service was not ready: {}", e))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/v1.PodResourcesLister/List");
            self.inner
                .unary(tonic::Request::new(request), path, codec)
                .await
        }

        pub async fn get_allocatable_resources(
            &mut self,
            request: AllocatableResourcesRequest,
        ) -> Result<tonic::Response<AllocatableResourcesResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("service was not ready: {}", e))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/v1.PodResourcesLister/GetAllocatableResources",
            );
            self.inner
                .unary(tonic::Request::new(request), path, codec)
                .await
        }
    }
}

pub use lister_client::PodResourcesListerClient;

#[derive(Debug, Clone)]
pub struct PodResourcesClientConfig {
    pub socket_path: PathBuf,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PodResourcesClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/kubelet/pod-resources/kubelet.sock"),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

struct ConnectionState {
    channel: Option<Channel>,
    current_backoff: Duration,
}

/// Reconnecting client over the kubelet pod-resources socket
pub struct PodResourcesClient {
    config: PodResourcesClientConfig,
    state: RwLock<ConnectionState>,
}

impl PodResourcesClient {
    pub fn new(config: PodResourcesClientConfig) -> Self {
        let initial_backoff = config.initial_backoff;
        Self {
            config,
            state: RwLock::new(ConnectionState {
                channel: None,
                current_backoff: initial_backoff,
            }),
        }
    }

    async fn channel(&self) -> Result<Channel> {
        {
            let state = self.state.read().await;
            if let Some(channel) = &state.channel {
                return Ok(channel.clone());
            }
        }

        let mut state = self.state.write().await;
        if let Some(channel) = &state.channel {
            return Ok(channel.clone());
        }

        let socket_path = self.config.socket_path.clone();
        // the uri is a placeholder, the connector dials the unix socket
        let connect = Endpoint::try_from("http://[::1]:0")
            .context("invalid placeholder endpoint")?
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket_path.clone())
            }))
            .await;

        match connect {
            Ok(channel) => {
                info!(socket = %self.config.socket_path.display(), "pod resources connected");
                state.channel = Some(channel.clone());
                state.current_backoff = self.config.initial_backoff;
                Ok(channel)
            }
            Err(e) => {
                let backoff = state.current_backoff;
                state.current_backoff = (backoff * 2).min(self.config.max_backoff);
                warn!(
                    socket = %self.config.socket_path.display(),
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "pod resources connection failed"
                );
                tokio::time::sleep(backoff).await;
                Err(anyhow::Error::new(e).context("pod resources connection failed"))
            }
        }
    }

    async fn reset_channel(&self) {
        let mut state = self.state.write().await;
        state.channel = None;
        debug!("pod resources channel reset after stream error");
    }

    pub async fn list_pod_resources(&self) -> Result<v1::ListPodResourcesResponse> {
        let channel = self.channel().await?;
        let mut client = PodResourcesListerClient::new(channel);
        match client.list(v1::ListPodResourcesRequest {}).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.reset_channel().await;
                Err(anyhow::Error::new(status).context("list pod resources failed"))
            }
        }
    }

    pub async fn get_allocatable_resources(&self) -> Result<v1::AllocatableResourcesResponse> {
        let channel = self.channel().await?;
        let mut client = PodResourcesListerClient::new(channel);
        match client
            .get_allocatable_resources(v1::AllocatableResourcesRequest {})
            .await
        {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.reset_channel().await;
                Err(anyhow::Error::new(status).context("get allocatable resources failed"))
            }
        }
    }
}

/// NUMA ids a container's devices and resources are pinned to
pub fn container_numa_nodes(container: &v1::ContainerResources) -> Vec<i32> {
    let mut numas: Vec<i32> = container
        .devices
        .iter()
        .filter_map(|d| d.topology.as_ref())
        .flat_map(|t| t.nodes.iter().map(|n| n.id as i32))
        .chain(container.resources.iter().flat_map(|r| {
            r.original_topology_aware_quantity_list
                .iter()
                .map(|q| q.node as i32)
        }))
        .collect();
    numas.sort_unstable();
    numas.dedup();
    numas
}
