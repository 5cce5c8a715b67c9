//! Request/response payloads of the gateway's connection API.
//!
//! Request payloads keep every field optional so that a missing field can be
//! reported by name instead of failing deserialization; the gateway service
//! validates them before anything else happens.

use crate::error::ErrorKind;
use crate::queue::{QueueNames, Role};
use serde::{Deserialize, Serialize};

/// Purpose a relay is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayType {
    GatekeeperRelay,
    GatewayRelay,
    GeneralRelay,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub relay_type: Option<RelayType>,
}

/// A consumer or provider application system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDescriptor {
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub authentication_info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudDescriptor {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Sent to the provider-side gateway to open the provider leg of a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConnectionRequest {
    #[serde(default)]
    pub relay: Option<RelayDescriptor>,
    #[serde(default)]
    pub consumer: Option<SystemDescriptor>,
    #[serde(default)]
    pub provider: Option<SystemDescriptor>,
    #[serde(default)]
    pub consumer_cloud: Option<CloudDescriptor>,
    #[serde(default)]
    pub provider_cloud: Option<CloudDescriptor>,
    #[serde(default)]
    pub service_definition: Option<String>,
    /// Consumer-side gateway public key, base64.
    #[serde(default)]
    pub consumer_gateway_public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConnectionResponse {
    pub queue_id: String,
    /// Name the consumer side must use to derive the session's queue names.
    pub peer_name: String,
    /// Provider-side gateway public key, base64.
    pub provider_gateway_public_key: String,
    pub queues: QueueNames,
}

/// Sent to the consumer-side gateway once the provider leg exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConnectionRequest {
    #[serde(default)]
    pub relay: Option<RelayDescriptor>,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub peer_name: Option<String>,
    #[serde(default)]
    pub provider_gateway_public_key: Option<String>,
    #[serde(default)]
    pub consumer: Option<SystemDescriptor>,
    #[serde(default)]
    pub provider: Option<SystemDescriptor>,
    #[serde(default)]
    pub consumer_cloud: Option<CloudDescriptor>,
    #[serde(default)]
    pub provider_cloud: Option<CloudDescriptor>,
    #[serde(default)]
    pub service_definition: Option<String>,
}

/// Snapshot of one registered tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub queue_id: String,
    pub peer_name: String,
    pub role: Role,
    pub relay_address: String,
    pub relay_port: u16,
    pub relay_secure: bool,
    pub consumer: SystemDescriptor,
    pub provider: SystemDescriptor,
    pub consumer_cloud: CloudDescriptor,
    pub provider_cloud: CloudDescriptor,
    pub service_definition: String,
    /// Local listening port, consumer side only.
    pub consumer_server_socket_port: Option<u16>,
    pub started_at_unix: u64,
    pub communication_started: bool,
}

/// Requests accepted by the local control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    ConnectProvider(ProviderConnectionRequest),
    ConnectConsumer(ConsumerConnectionRequest),
    CloseSession { queue_id: String },
    ListSessions {
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        size: Option<usize>,
    },
    PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResponse {
    ProviderConnected(ProviderConnectionResponse),
    ConsumerConnected { server_port: u16 },
    SessionClosed { queue_id: String },
    Sessions { total: usize, sessions: Vec<ActiveSession> },
    PublicKey { public_key: String },
    Error { kind: ErrorKind, message: String },
}
