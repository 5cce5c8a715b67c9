//! Connection request validation.
//!
//! Fields are checked in a fixed order and the first failure wins, so the
//! caller always learns about exactly one field. Nothing is opened or
//! registered before a request has passed.

use relaytun_core::messages::{
    CloudDescriptor, ConsumerConnectionRequest, ProviderConnectionRequest, RelayDescriptor,
    RelayType, SystemDescriptor,
};
use relaytun_core::queue::is_valid_queue_id;
use relaytun_core::{GatewayError, GatewayPublicKey, GatewayResult, RelayEndpoint};

/// A provider-side request that passed validation.
#[derive(Debug, Clone)]
pub struct ProviderPlan {
    pub relay: RelayEndpoint,
    pub consumer: SystemDescriptor,
    pub provider: SystemDescriptor,
    pub provider_address: String,
    pub provider_port: u16,
    pub consumer_cloud: CloudDescriptor,
    pub provider_cloud: CloudDescriptor,
    pub service_definition: String,
    pub consumer_key: GatewayPublicKey,
}

/// A consumer-side request that passed validation.
#[derive(Debug, Clone)]
pub struct ConsumerPlan {
    pub relay: RelayEndpoint,
    pub queue_id: String,
    pub peer_name: String,
    pub provider_key: GatewayPublicKey,
    pub consumer: SystemDescriptor,
    pub provider: SystemDescriptor,
    pub consumer_cloud: CloudDescriptor,
    pub provider_cloud: CloudDescriptor,
    pub service_definition: String,
}

pub fn validate_provider_request(request: &ProviderConnectionRequest) -> GatewayResult<ProviderPlan> {
    let relay = relay(request.relay.as_ref())?;
    let (consumer, _, _) = system("consumer", request.consumer.as_ref())?;
    let (provider, provider_address, provider_port) = system("provider", request.provider.as_ref())?;
    let consumer_cloud = cloud("consumer_cloud", request.consumer_cloud.as_ref())?;
    let provider_cloud = cloud("provider_cloud", request.provider_cloud.as_ref())?;
    let service_definition = required_text("service_definition", request.service_definition.as_deref())?;
    let consumer_key = public_key(
        "consumer_gateway_public_key",
        request.consumer_gateway_public_key.as_deref(),
    )?;

    Ok(ProviderPlan {
        relay,
        consumer,
        provider,
        provider_address,
        provider_port,
        consumer_cloud,
        provider_cloud,
        service_definition,
        consumer_key,
    })
}

pub fn validate_consumer_request(request: &ConsumerConnectionRequest) -> GatewayResult<ConsumerPlan> {
    let relay = relay(request.relay.as_ref())?;

    let queue_id = required_text("queue_id", request.queue_id.as_deref())?;
    if !is_valid_queue_id(&queue_id) {
        return Err(GatewayError::invalid(
            "queue_id",
            "must be a 48 character alphanumeric id",
        ));
    }
    let peer_name = required_text("peer_name", request.peer_name.as_deref())?;
    if peer_name.contains(char::is_whitespace) {
        return Err(GatewayError::invalid("peer_name", "must not contain whitespace"));
    }
    let provider_key = public_key(
        "provider_gateway_public_key",
        request.provider_gateway_public_key.as_deref(),
    )?;

    let (consumer, _, _) = system("consumer", request.consumer.as_ref())?;
    let (provider, _, _) = system("provider", request.provider.as_ref())?;
    let consumer_cloud = cloud("consumer_cloud", request.consumer_cloud.as_ref())?;
    let provider_cloud = cloud("provider_cloud", request.provider_cloud.as_ref())?;
    let service_definition = required_text("service_definition", request.service_definition.as_deref())?;

    Ok(ConsumerPlan {
        relay,
        queue_id,
        peer_name,
        provider_key,
        consumer,
        provider,
        consumer_cloud,
        provider_cloud,
        service_definition,
    })
}

fn relay(descriptor: Option<&RelayDescriptor>) -> GatewayResult<RelayEndpoint> {
    let descriptor = descriptor.ok_or_else(|| GatewayError::invalid("relay", "is required"))?;
    let address = required_text("relay.address", descriptor.address.as_deref())?;
    let port = port("relay.port", descriptor.port)?;
    match descriptor.relay_type {
        None => return Err(GatewayError::invalid("relay.relay_type", "is required")),
        Some(RelayType::GatekeeperRelay) => {
            return Err(GatewayError::invalid(
                "relay.relay_type",
                "gatekeeper relays cannot carry gateway sessions",
            ))
        }
        Some(RelayType::GatewayRelay | RelayType::GeneralRelay) => {}
    }
    Ok(RelayEndpoint::new(address, port, descriptor.secure))
}

/// Validates a system descriptor and returns it with its address and port.
fn system(
    field: &str,
    descriptor: Option<&SystemDescriptor>,
) -> GatewayResult<(SystemDescriptor, String, u16)> {
    let descriptor = descriptor.ok_or_else(|| GatewayError::invalid(field, "is required"))?;
    required_text(&format!("{field}.system_name"), descriptor.system_name.as_deref())?;
    let address = required_text(&format!("{field}.address"), descriptor.address.as_deref())?;
    let port = port(&format!("{field}.port"), descriptor.port)?;
    Ok((descriptor.clone(), address, port))
}

fn cloud(field: &str, descriptor: Option<&CloudDescriptor>) -> GatewayResult<CloudDescriptor> {
    let descriptor = descriptor.ok_or_else(|| GatewayError::invalid(field, "is required"))?;
    required_text(&format!("{field}.operator"), descriptor.operator.as_deref())?;
    required_text(&format!("{field}.name"), descriptor.name.as_deref())?;
    Ok(descriptor.clone())
}

fn required_text(field: &str, value: Option<&str>) -> GatewayResult<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        Some(_) => Err(GatewayError::invalid(field, "must not be blank")),
        None => Err(GatewayError::invalid(field, "is required")),
    }
}

fn port(field: &str, value: Option<i32>) -> GatewayResult<u16> {
    let value = value.ok_or_else(|| GatewayError::invalid(field, "is required"))?;
    match u16::try_from(value) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(GatewayError::invalid(
            field,
            format!("{value} is outside 1..=65535"),
        )),
    }
}

fn public_key(field: &str, value: Option<&str>) -> GatewayResult<GatewayPublicKey> {
    let encoded = required_text(field, value)?;
    GatewayPublicKey::from_base64(&encoded)
        .map_err(|e| GatewayError::invalid(field, format!("not a gateway public key: {e}")))
}
