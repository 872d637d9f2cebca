use anyhow::{format_err, Error};
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};

use crate::error::ActuatorError;

pub const LABEL_CLUSTER_ID: &str = "machine.openshift.io/cluster-api-cluster";
pub const LABEL_MACHINE_TYPE: &str = "machine.openshift.io/cluster-api-machine-type";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Machine",
    group = "machine.openshift.io",
    version = "v1beta1",
    namespaced,
    doc = "Machine backed by a single EC2 instance.",
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub provider_spec: ProviderSpec,
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ProviderSpec {
    /// Serialized `AwsMachineProviderConfig`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Serialized `AwsMachineProviderStatus`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<MachineAddress>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: NodeAddressType,
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NodeAddressType {
    ExternalIP,
    InternalIP,
    ExternalDNS,
    InternalDNS,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsMachineProviderConfig {
    pub ami: AwsResourceReference,
    pub instance_type: String,
    pub tags: Vec<TagSpecification>,
    pub iam_instance_profile: Option<AwsResourceReference>,
    pub user_data_secret: Option<LocalObjectReference>,
    pub credentials_secret: Option<LocalObjectReference>,
    pub key_name: Option<String>,
    pub device_index: i32,
    pub public_ip: Option<bool>,
    pub security_groups: Vec<AwsResourceReference>,
    pub subnet: AwsResourceReference,
    pub placement: Placement,
    pub load_balancers: Vec<LoadBalancerReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsResourceReference {
    pub id: Option<String>,
    pub arn: Option<String>,
    pub filters: Vec<Filter>,
}

impl AwsResourceReference {
    pub fn with_id(id: &str) -> Self {
        AwsResourceReference {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_filters(filters: Vec<Filter>) -> Self {
        AwsResourceReference {
            filters,
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: &str, values: &[&str]) -> Self {
        Filter {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerReference {
    pub name: String,
    #[serde(rename = "type")]
    pub load_balancer_type: LoadBalancerType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    /// Registered by instance id.
    Classic,
    /// Registered through the target groups behind it.
    Network,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSpecification {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    pub region: String,
    pub availability_zone: String,
    pub tenancy: String,
}

impl Placement {
    pub fn tenancy(&self) -> Result<Option<Tenancy>, ActuatorError> {
        match self.tenancy.as_str() {
            "" => Ok(None),
            "default" => Ok(Some(Tenancy::Default)),
            "dedicated" => Ok(Some(Tenancy::Dedicated)),
            "host" => Ok(Some(Tenancy::Host)),
            other => Err(ActuatorError::InvalidTenancy(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tenancy {
    Default,
    Dedicated,
    Host,
}

impl Tenancy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tenancy::Default => "default",
            Tenancy::Dedicated => "dedicated",
            Tenancy::Host => "host",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsMachineProviderStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
    pub conditions: Vec<AwsMachineProviderCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachineProviderCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_probe_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    MachineCreation,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

pub fn provider_config_from_machine(machine: &Machine) -> Result<AwsMachineProviderConfig, Error> {
    let value = machine
        .spec
        .provider_spec
        .value
        .clone()
        .ok_or(format_err!("Missing provider spec value"))?;
    let config = serde_json::from_value(value)?;
    Ok(config)
}

pub fn provider_status_from_machine(machine: &Machine) -> Result<AwsMachineProviderStatus, Error> {
    let value = machine
        .status
        .as_ref()
        .and_then(|status| status.provider_status.clone());
    match value {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Default::default()),
    }
}

pub fn cluster_id(machine: &Machine) -> Result<&str, ActuatorError> {
    machine
        .labels()
        .get(LABEL_CLUSTER_ID)
        .map(String::as_str)
        .ok_or_else(|| ActuatorError::MissingClusterId(machine.name_any()))
}

/// Control plane machines are never cleaned up when stopped.
pub fn is_master(machine: &Machine) -> bool {
    machine.labels().get(LABEL_MACHINE_TYPE).map(String::as_str) == Some("master")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AwsScope {
    pub region: String,
    pub credentials: Option<AwsCredentials>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub const RUNNING: [InstanceState; 2] = [InstanceState::Running, InstanceState::Pending];
    pub const STOPPED: [InstanceState; 2] = [InstanceState::Stopped, InstanceState::Stopping];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instance {
    pub id: String,
    pub state: Option<InstanceState>,
    pub launch_time: Option<DateTime<Utc>>,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub public_dns_name: Option<String>,
    pub private_dns_name: Option<String>,
    pub availability_zone: Option<String>,
}

impl Instance {
    /// `aws:///<availability zone>/<instance id>`, once the zone is known.
    pub fn provider_id(&self) -> Option<String> {
        self.availability_zone
            .as_ref()
            .map(|zone| format!("aws:///{zone}/{}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    pub arn: String,
    /// `None` for target types other than instance and ip.
    pub target_type: Option<TargetType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Instance,
    Ip,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub creation_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub instance_tags: Vec<Tag>,
    pub volume_tags: Vec<Tag>,
    pub network_interface: NetworkInterface,
    /// Base64 encoded.
    pub user_data: String,
    pub availability_zone: Option<String>,
    pub tenancy: Option<Tenancy>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInterface {
    pub device_index: i32,
    pub associate_public_ip_address: Option<bool>,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
}
