use std::sync::Arc;

use crate::{
    client::KubeClient,
    cloud_provider::CloudProvider,
    conditions::{set_condition, UpdateConditionCheck},
    error::ActuatorError,
    instances::{
        get_running_instances, launch_instance, remove_stopped_machine, split_newest,
        terminate_instances,
    },
    load_balancers::register_with_load_balancers,
    model::{
        is_master, provider_config_from_machine, provider_status_from_machine,
        AwsCredentials, AwsMachineProviderConfig, AwsMachineProviderStatus, AwsScope,
        ConditionStatus, ConditionType, Instance, InstanceState, Machine, MachineAddress,
        NodeAddressType,
    },
    settings::ActuatorSettings,
};
use anyhow::{format_err, Context, Error};
use chrono::Utc;
use futures::{StreamExt, TryFutureExt};
use kube::{
    runtime::{
        controller::Action,
        finalizer::{self, finalizer, Event},
        watcher, Controller,
    },
    Api, ResourceExt,
};

const FINALIZER_NAME: &str = "machine.openshift.io/aws-machine-cleanup";
const FIELD_MANAGER: &str = "aws-machine-actuator";
const USER_DATA_SECRET_KEY: &str = "userData";
const CREDENTIALS_ACCESS_KEY_ID: &str = "aws_access_key_id";
const CREDENTIALS_SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

pub const MACHINE_CREATION_SUCCEEDED: &str = "MachineCreationSucceeded";
pub const MACHINE_CREATION_FAILED: &str = "MachineCreationFailed";

#[derive(thiserror::Error, Debug)]
enum OperatorError {
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

pub struct Operator<K, P> {
    pub client: Arc<K>,
    pub cloud_provider: Arc<P>,
    pub settings: ActuatorSettings,
}

impl<K, P> Operator<K, P>
where
    K: KubeClient + Sync + 'static,
    P: CloudProvider + Sync + 'static,
{
    pub async fn run(self) -> Result<(), Error> {
        let api: Api<Machine> = Api::all(self.client.underlying_client().clone());
        Controller::new(api, watcher::Config::default())
            .run(
                |m, c| c.reconcile_or_cleanup(m),
                |m, e, c| c.error_policy(m, e),
                Arc::new(self),
            )
            .for_each(|res| async move {
                if let Ok((obj, _)) = res {
                    tracing::debug!("Reconciled machine {}", obj.name);
                }
            })
            .await;
        Ok(())
    }
}

/// A machine together with its decoded provider config and the AWS scope it
/// is reconciled in. Resolved once per reconcile.
#[derive(Debug)]
pub struct MachineContext<'a> {
    pub machine: &'a Machine,
    pub config: AwsMachineProviderConfig,
    pub scope: AwsScope,
}

impl<K, P> Operator<K, P>
where
    K: KubeClient,
    P: CloudProvider,
{
    #[tracing::instrument(skip_all, fields(name = %machine.name_any(), namespace = ?machine.namespace()))]
    async fn reconcile_or_cleanup(
        self: Arc<Self>,
        machine: Arc<Machine>,
    ) -> Result<Action, finalizer::Error<OperatorError>> {
        let ns = machine
            .metadata
            .namespace
            .as_deref()
            .ok_or(finalizer::Error::UnnamedObject)?;

        let api: Api<Machine> = Api::namespaced(self.client.underlying_client().clone(), ns);

        finalizer(&api, FINALIZER_NAME, machine, |event| async {
            match event {
                Event::Apply(m) => self.reconcile(m).map_err(OperatorError::Anyhow).await,
                Event::Cleanup(m) => self.cleanup(m).map_err(OperatorError::Anyhow).await,
            }
        })
        .await
    }

    async fn reconcile(&self, machine: Arc<Machine>) -> Result<Action, Error> {
        let context = self.context(&machine).await?;
        if self.exists(&context).await? {
            self.update(&context).await
        } else {
            self.create(&context).await
        }
    }

    async fn cleanup(&self, machine: Arc<Machine>) -> Result<Action, Error> {
        tracing::debug!("Running cleanup..");
        let context = self.context(&machine).await?;
        self.delete(&context).await?;
        Ok(Action::await_change())
    }

    fn error_policy(
        self: Arc<Self>,
        _machine: Arc<Machine>,
        err: &finalizer::Error<OperatorError>,
    ) -> Action {
        tracing::error!("Error: {}", err);
        Action::requeue(self.settings.error_requeue_period)
    }

    /// Decodes the provider config and resolves the AWS scope, reading the
    /// credentials secret when one is referenced.
    pub async fn context<'a>(&self, machine: &'a Machine) -> Result<MachineContext<'a>, Error> {
        let config = provider_config_from_machine(machine)?;
        let credentials = match &config.credentials_secret {
            Some(secret_ref) => Some(self.credentials(machine, &secret_ref.name).await?),
            None => None,
        };

        let scope = AwsScope {
            region: config.placement.region.clone(),
            credentials,
        };

        Ok(MachineContext {
            machine,
            config,
            scope,
        })
    }

    /// Launches a new instance for the machine. A failure is recorded as a
    /// condition on the machine before it is returned.
    pub async fn create(&self, context: &MachineContext<'_>) -> Result<Action, Error> {
        tracing::info!("Creating machine..");
        match self.create_machine(context).await {
            Ok(instance) => self.update_status(context.machine, Some(&instance)).await,
            Err(err) => {
                tracing::error!("Error creating machine: {err:#}");
                if let Err(update_err) = self.record_creation_failure(context.machine, &err).await {
                    tracing::error!("Error updating machine conditions: {update_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn create_machine(&self, context: &MachineContext<'_>) -> Result<Instance, Error> {
        let MachineContext {
            machine,
            config,
            scope,
        } = context;

        // Stopped masters are kept around on purpose.
        if !is_master(machine) {
            remove_stopped_machine(self.cloud_provider.as_ref(), scope, machine)
                .await
                .context("unable to remove stopped machines")?;
        }

        let user_data = self.user_data(machine, config).await?;

        let instance = launch_instance(
            self.cloud_provider.as_ref(),
            scope,
            machine,
            config,
            &user_data,
        )
        .await?;

        register_with_load_balancers(
            self.cloud_provider.as_ref(),
            scope,
            &config.load_balancers,
            &instance,
        )
        .await?;

        Ok(instance)
    }

    /// Syncs the machine status with its newest running instance, terminating
    /// any older duplicates. Instance settings themselves are never changed.
    pub async fn update(&self, context: &MachineContext<'_>) -> Result<Action, Error> {
        tracing::debug!("Updating machine..");
        let instances = self.machine_instances(context).await?;
        tracing::debug!("Found {} instances for machine", instances.len());

        let Some((newest, stale)) = split_newest(instances) else {
            // The instance can vanish between the existence check and here.
            tracing::warn!("Attempted to update machine but no instances found");
            self.update_status(context.machine, None).await?;
            return Err(ActuatorError::NoInstancesToUpdate.into());
        };

        tracing::debug!("Instance {} found", newest.id);

        if !stale.is_empty() {
            terminate_instances(self.cloud_provider.as_ref(), &context.scope, &stale).await?;
        }

        let action = self.update_status(context.machine, Some(&newest)).await?;

        register_with_load_balancers(
            self.cloud_provider.as_ref(),
            &context.scope,
            &context.config.load_balancers,
            &newest,
        )
        .await?;

        Ok(action)
    }

    pub async fn delete(&self, context: &MachineContext<'_>) -> Result<(), Error> {
        tracing::info!("Deleting machine..");
        let instances = self.machine_instances(context).await?;
        if instances.is_empty() {
            tracing::warn!("No instances found to delete for machine");
            return Ok(());
        }

        terminate_instances(self.cloud_provider.as_ref(), &context.scope, &instances).await
    }

    pub async fn exists(&self, context: &MachineContext<'_>) -> Result<bool, Error> {
        tracing::debug!("Checking if machine exists..");
        let instances = self.machine_instances(context).await?;
        match instances.first() {
            Some(instance) => {
                tracing::debug!("Instance exists as {}", instance.id);
                Ok(true)
            }
            None => {
                tracing::debug!("Instance does not exist");
                Ok(false)
            }
        }
    }

    pub async fn describe(&self, context: &MachineContext<'_>) -> Result<Option<Instance>, Error> {
        let instances = self.machine_instances(context).await?;
        Ok(instances.into_iter().next())
    }

    async fn machine_instances(&self, context: &MachineContext<'_>) -> Result<Vec<Instance>, Error> {
        get_running_instances(self.cloud_provider.as_ref(), &context.scope, context.machine)
            .await
            .context("error getting running instances")
    }

    async fn credentials(&self, machine: &Machine, secret_name: &str) -> Result<AwsCredentials, Error> {
        let namespace = machine
            .namespace()
            .ok_or(format_err!("Missing machine namespace"))?;

        let secret = self
            .client
            .get_secret(&namespace, secret_name)
            .await?
            .ok_or_else(|| ActuatorError::InvalidCredentialsSecret(secret_name.to_string()))?;

        let value = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
                .ok_or_else(|| ActuatorError::InvalidCredentialsSecret(secret_name.to_string()))
        };

        Ok(AwsCredentials {
            access_key_id: value(CREDENTIALS_ACCESS_KEY_ID)?,
            secret_access_key: value(CREDENTIALS_SECRET_ACCESS_KEY)?,
        })
    }

    async fn user_data(
        &self,
        machine: &Machine,
        config: &AwsMachineProviderConfig,
    ) -> Result<Vec<u8>, Error> {
        let Some(secret_ref) = &config.user_data_secret else {
            return Ok(vec![]);
        };

        let namespace = machine
            .namespace()
            .ok_or(format_err!("Missing machine namespace"))?;

        let secret = self
            .client
            .get_secret(&namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| ActuatorError::MissingUserDataSecret(secret_ref.name.clone()))?;

        match secret
            .data
            .and_then(|mut data| data.remove(USER_DATA_SECRET_KEY))
        {
            Some(bytes) => Ok(bytes.0),
            None => {
                tracing::warn!(
                    "Secret {}/{} does not have {:?} field set. No user data applied to the instance.",
                    namespace,
                    secret_ref.name,
                    USER_DATA_SECRET_KEY
                );
                Ok(vec![])
            }
        }
    }

    /// Reflects the instance (or its absence) into the machine status.
    async fn update_status(
        &self,
        machine: &Machine,
        instance: Option<&Instance>,
    ) -> Result<Action, Error> {
        tracing::debug!("Updating status..");
        let mut aws_status = provider_status_from_machine(machine)?;

        let addresses = match instance {
            None => {
                aws_status.instance_id = None;
                aws_status.instance_state = None;
                vec![]
            }
            Some(instance) => {
                aws_status.instance_id = Some(instance.id.clone());
                aws_status.instance_state = instance.state.map(|s| s.as_str().to_string());
                machine_addresses(instance)
            }
        };

        aws_status.conditions = set_condition(
            std::mem::take(&mut aws_status.conditions),
            ConditionType::MachineCreation,
            ConditionStatus::True,
            MACHINE_CREATION_SUCCEEDED,
            "machine successfully created",
            UpdateConditionCheck::IfReasonOrMessageChange,
        );

        self.update_machine_status(machine, &aws_status, Some(addresses))
            .await?;

        if let Some(provider_id) = instance.and_then(Instance::provider_id) {
            if machine.spec.provider_id.as_deref() != Some(provider_id.as_str()) {
                tracing::info!("Setting provider ID {provider_id}..");
                self.client
                    .patch_machine_provider_id(machine, &provider_id)
                    .await
                    .context("error setting machine provider ID")?;
            }
        }

        // Addresses are only complete once the instance leaves the pending state.
        if instance.and_then(|i| i.state) == Some(InstanceState::Pending) {
            tracing::info!("Instance state still pending, requeueing..");
            return Ok(Action::requeue(self.settings.pending_requeue_period));
        }

        Ok(Action::requeue(self.settings.resync_period))
    }

    async fn record_creation_failure(&self, machine: &Machine, err: &Error) -> Result<(), Error> {
        tracing::debug!("Updating machine conditions..");
        let mut aws_status = provider_status_from_machine(machine)?;

        aws_status.conditions = set_condition(
            std::mem::take(&mut aws_status.conditions),
            ConditionType::MachineCreation,
            ConditionStatus::True,
            MACHINE_CREATION_FAILED,
            &format!("{err:#}"),
            UpdateConditionCheck::IfReasonOrMessageChange,
        );

        self.update_machine_status(machine, &aws_status, None).await
    }

    async fn update_machine_status(
        &self,
        machine: &Machine,
        aws_status: &AwsMachineProviderStatus,
        addresses: Option<Vec<MachineAddress>>,
    ) -> Result<(), Error> {
        let current_aws_status = provider_status_from_machine(machine)?;
        let mut status = machine.status.clone().unwrap_or_default();

        let addresses_changed = addresses
            .as_ref()
            .is_some_and(|addresses| status.addresses.as_ref() != Some(addresses));

        if current_aws_status == *aws_status && !addresses_changed {
            tracing::debug!("Status unchanged");
            return Ok(());
        }

        tracing::info!("Machine status has changed, updating..");
        status.provider_status = Some(serde_json::to_value(aws_status)?);
        if let Some(addresses) = addresses {
            status.addresses = Some(addresses);
        }
        status.last_updated = Some(Utc::now());

        self.client
            .patch_machine_status(machine, &status, FIELD_MANAGER)
            .await
            .context("error updating machine status")
    }
}

fn machine_addresses(instance: &Instance) -> Vec<MachineAddress> {
    [
        (NodeAddressType::ExternalIP, &instance.public_ip_address),
        (NodeAddressType::InternalIP, &instance.private_ip_address),
        (NodeAddressType::ExternalDNS, &instance.public_dns_name),
        (NodeAddressType::InternalDNS, &instance.private_dns_name),
    ]
    .into_iter()
    .filter_map(|(address_type, address)| {
        address.as_ref().map(|address| MachineAddress {
            address_type,
            address: address.clone(),
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use chrono::{DateTime, TimeZone};
    use k8s_openapi::{api::core::v1::Secret, ByteString};
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;

    use crate::{
        client::MockKubeClient,
        cloud_provider::MockCloudProvider,
        model::{
            AwsMachineProviderCondition, AwsResourceReference, Filter, LoadBalancerReference,
            LoadBalancerType, LocalObjectReference, MachineSpec, MachineStatus, Placement,
            ProviderSpec, LABEL_CLUSTER_ID, LABEL_MACHINE_TYPE,
        },
    };

    use super::*;

    fn config() -> AwsMachineProviderConfig {
        AwsMachineProviderConfig {
            ami: AwsResourceReference::with_id("ami-a9acbbd6"),
            instance_type: "m4.xlarge".to_string(),
            subnet: AwsResourceReference::with_id("subnet-0e56b13a64ff8a941"),
            placement: Placement {
                region: "us-east-1".to_string(),
                availability_zone: "us-east-1a".to_string(),
                tenancy: "".to_string(),
            },
            ..Default::default()
        }
    }

    fn machine(config: &AwsMachineProviderConfig) -> Machine {
        Machine {
            metadata: ObjectMeta {
                name: Some("machine1".to_string()),
                namespace: Some("machine1_namespace".to_string()),
                labels: Some({
                    let mut map = BTreeMap::new();
                    map.insert(LABEL_CLUSTER_ID.to_string(), "cluster1".to_string());
                    map
                }),
                ..Default::default()
            },
            spec: MachineSpec {
                provider_spec: ProviderSpec {
                    value: Some(serde_json::to_value(config).unwrap()),
                },
                provider_id: None,
            },
            status: None,
        }
    }

    fn scope() -> AwsScope {
        AwsScope {
            region: "us-east-1".to_string(),
            credentials: None,
        }
    }

    fn instance(id: &str, state: InstanceState, launched_day: Option<u32>) -> Instance {
        Instance {
            id: id.to_string(),
            state: Some(state),
            launch_time: launched_day
                .map(|day| Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            private_ip_address: Some("10.0.0.1".to_string()),
            private_dns_name: Some("ip-10-0-0-1.ec2.internal".to_string()),
            ..Default::default()
        }
    }

    fn private_addresses() -> Vec<MachineAddress> {
        vec![
            MachineAddress {
                address_type: NodeAddressType::InternalIP,
                address: "10.0.0.1".to_string(),
            },
            MachineAddress {
                address_type: NodeAddressType::InternalDNS,
                address: "ip-10-0-0-1.ec2.internal".to_string(),
            },
        ]
    }

    fn secret(entries: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn has_state_filter(filters: &[Filter], state: &str) -> bool {
        filters
            .iter()
            .any(|f| f.name == "instance-state-name" && f.values.iter().any(|v| v == state))
    }

    fn aws_status(status: &MachineStatus) -> AwsMachineProviderStatus {
        serde_json::from_value(status.provider_status.clone().unwrap()).unwrap()
    }

    fn operator(
        client: MockKubeClient,
        cloud_provider: MockCloudProvider,
    ) -> Operator<MockKubeClient, MockCloudProvider> {
        Operator {
            client: client.into(),
            cloud_provider: cloud_provider.into(),
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn when_instance_exists_update_status() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "running"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![Instance {
                        public_ip_address: Some("54.1.2.3".to_string()),
                        public_dns_name: Some("ec2-54-1-2-3.compute.amazonaws.com".to_string()),
                        ..instance("i-1", InstanceState::Running, Some(1))
                    }])
                })
            })
            .times(2);

        client
            .expect_patch_machine_status()
            .withf(|_, status, manager| {
                let aws_status = aws_status(status);
                let addresses: Vec<NodeAddressType> = status
                    .addresses
                    .iter()
                    .flatten()
                    .map(|a| a.address_type)
                    .collect();
                manager == "aws-machine-actuator"
                    && status.last_updated.is_some()
                    && aws_status.instance_id.as_deref() == Some("i-1")
                    && aws_status.instance_state.as_deref() == Some("running")
                    && aws_status.conditions.len() == 1
                    && aws_status.conditions[0].reason == MACHINE_CREATION_SUCCEEDED
                    && addresses
                        == vec![
                            NodeAddressType::ExternalIP,
                            NodeAddressType::InternalIP,
                            NodeAddressType::ExternalDNS,
                            NodeAddressType::InternalDNS,
                        ]
            })
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let action = operator
            .reconcile(Arc::new(machine(&config())))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn when_no_instance_exists_create_it() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.user_data_secret = Some(LocalObjectReference {
            name: "worker-user-data".to_string(),
        });

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "running"))
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "stopped"))
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        client
            .expect_get_secret()
            .with(eq("machine1_namespace"), eq("worker-user-data"))
            .returning(|_, _| {
                Box::pin(async { Ok(Some(secret(&[("userData", "#cloud-config")]))) })
            })
            .once();

        cloud_provider
            .expect_run_instance()
            .withf(|scope, request| {
                *scope == self::scope()
                    && request.image_id == "ami-a9acbbd6"
                    && request.instance_type == "m4.xlarge"
                    && request.user_data == "I2Nsb3VkLWNvbmZpZw=="
            })
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Pending, None)]) })
            })
            .once();

        client
            .expect_patch_machine_status()
            .withf(|_, status, _| {
                let aws_status = aws_status(status);
                aws_status.instance_id.as_deref() == Some("i-1")
                    && aws_status.instance_state.as_deref() == Some("pending")
                    && status.addresses == Some(private_addresses())
            })
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let action = operator.reconcile(Arc::new(machine(&config))).await.unwrap();

        // Pending instances are polled until their addresses settle
        assert_eq!(action, Action::requeue(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn when_master_is_created_keep_stopped_instances() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut machine = machine(&config());
        machine
            .labels_mut()
            .insert(LABEL_MACHINE_TYPE.to_string(), "master".to_string());

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "running"))
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        cloud_provider
            .expect_run_instance()
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Running, Some(1))]) })
            })
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let action = operator.reconcile(Arc::new(machine)).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn when_creation_fails_record_failure_condition() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.subnet = AwsResourceReference::with_filters(vec![Filter::new(
            "tag:Name",
            &["cluster1-private-us-east-1a"],
        )]);

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "stopped"))
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        cloud_provider
            .expect_describe_subnets()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        client
            .expect_patch_machine_status()
            .withf(|_, status, _| {
                let aws_status = aws_status(status);
                status.addresses.is_none()
                    && aws_status.instance_id.is_none()
                    && aws_status.conditions.len() == 1
                    && aws_status.conditions[0].status == ConditionStatus::True
                    && aws_status.conditions[0].reason == MACHINE_CREATION_FAILED
                    && aws_status.conditions[0]
                        .message
                        .contains("no subnet IDs were found")
            })
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config);
        let context = operator.context(&machine).await.unwrap();
        let err = operator.create(&context).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<ActuatorError>(),
            Some(&ActuatorError::NoSubnetFound)
        );
    }

    #[tokio::test]
    async fn when_user_data_secret_is_missing_fail_creation() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.user_data_secret = Some(LocalObjectReference {
            name: "worker-user-data".to_string(),
        });

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        client
            .expect_get_secret()
            .returning(|_, _| Box::pin(async { Ok(None) }))
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config);
        let context = operator.context(&machine).await.unwrap();
        let err = operator.create(&context).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<ActuatorError>(),
            Some(&ActuatorError::MissingUserDataSecret(
                "worker-user-data".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn when_user_data_key_is_missing_launch_without_user_data() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.user_data_secret = Some(LocalObjectReference {
            name: "worker-user-data".to_string(),
        });

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        client
            .expect_get_secret()
            .returning(|_, _| Box::pin(async { Ok(Some(secret(&[("other", "value")]))) }))
            .once();

        cloud_provider
            .expect_run_instance()
            .withf(|_, request| request.user_data.is_empty())
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Running, Some(1))]) })
            })
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config);
        let context = operator.context(&machine).await.unwrap();
        operator.create(&context).await.unwrap();
    }

    #[tokio::test]
    async fn when_duplicate_instances_found_terminate_older_ones() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![
                        instance("i-1", InstanceState::Running, Some(1)),
                        instance("i-3", InstanceState::Running, Some(3)),
                        instance("i-2", InstanceState::Running, Some(2)),
                    ])
                })
            })
            .once();

        cloud_provider
            .expect_terminate_instances()
            .with(eq(scope()), eq(vec!["i-2".to_string(), "i-1".to_string()]))
            .returning(|_, _| Box::pin(async { Ok(()) }))
            .once();

        client
            .expect_patch_machine_status()
            .withf(|_, status, _| aws_status(status).instance_id.as_deref() == Some("i-3"))
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config());
        let context = operator.context(&machine).await.unwrap();
        let action = operator.update(&context).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn when_instance_vanished_on_update_clear_status_and_fail() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut machine = machine(&config());
        machine.status = Some(MachineStatus {
            provider_status: Some(serde_json::json!({
                "instanceId": "i-1",
                "instanceState": "running",
                "conditions": []
            })),
            addresses: Some(private_addresses()),
            last_updated: None,
        });

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        client
            .expect_patch_machine_status()
            .withf(|_, status, _| {
                let aws_status = aws_status(status);
                aws_status.instance_id.is_none()
                    && aws_status.instance_state.is_none()
                    && status.addresses == Some(vec![])
            })
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let context = operator.context(&machine).await.unwrap();
        let err = operator.update(&context).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<ActuatorError>(),
            Some(&ActuatorError::NoInstancesToUpdate)
        );
    }

    #[tokio::test]
    async fn when_status_is_unchanged_skip_patch() {
        let client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let created: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let current = AwsMachineProviderStatus {
            instance_id: Some("i-1".to_string()),
            instance_state: Some("running".to_string()),
            conditions: vec![AwsMachineProviderCondition {
                condition_type: ConditionType::MachineCreation,
                status: ConditionStatus::True,
                reason: MACHINE_CREATION_SUCCEEDED.to_string(),
                message: "machine successfully created".to_string(),
                last_probe_time: created,
                last_transition_time: created,
            }],
        };

        let mut machine = machine(&config());
        machine.status = Some(MachineStatus {
            provider_status: Some(serde_json::to_value(&current).unwrap()),
            addresses: Some(private_addresses()),
            last_updated: Some(created),
        });

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Running, Some(1))]) })
            })
            .once();

        let operator = operator(client, cloud_provider);
        let context = operator.context(&machine).await.unwrap();
        let action = operator.update(&context).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn when_machine_deleted_terminate_its_instances() {
        let client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        cloud_provider
            .expect_describe_instances()
            .withf(|_, filters| has_state_filter(filters, "pending"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![
                        instance("i-1", InstanceState::Running, Some(1)),
                        instance("i-2", InstanceState::Pending, None),
                    ])
                })
            })
            .once();

        cloud_provider
            .expect_terminate_instances()
            .with(eq(scope()), eq(vec!["i-1".to_string(), "i-2".to_string()]))
            .returning(|_, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let action = operator
            .cleanup(Arc::new(machine(&config())))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn when_nothing_to_delete_do_nothing() {
        let client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config());
        let context = operator.context(&machine).await.unwrap();
        operator.delete(&context).await.unwrap();
    }

    #[tokio::test]
    async fn when_credentials_secret_set_use_static_credentials() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.credentials_secret = Some(LocalObjectReference {
            name: "aws-credentials".to_string(),
        });

        client
            .expect_get_secret()
            .with(eq("machine1_namespace"), eq("aws-credentials"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(Some(secret(&[
                        ("aws_access_key_id", "AKIAEXAMPLE"),
                        ("aws_secret_access_key", "secret"),
                    ])))
                })
            })
            .once();

        cloud_provider
            .expect_describe_instances()
            .withf(|scope, _| {
                scope.region == "us-east-1"
                    && scope.credentials
                        == Some(AwsCredentials {
                            access_key_id: "AKIAEXAMPLE".to_string(),
                            secret_access_key: "secret".to_string(),
                        })
            })
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Running, Some(1))]) })
            })
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config);
        let context = operator.context(&machine).await.unwrap();
        let instance = operator.describe(&context).await.unwrap();

        assert_eq!(instance.map(|i| i.id), Some("i-1".to_string()));
    }

    #[tokio::test]
    async fn when_credentials_secret_is_incomplete_fail() {
        let mut client = MockKubeClient::new();
        let cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.credentials_secret = Some(LocalObjectReference {
            name: "aws-credentials".to_string(),
        });

        client
            .expect_get_secret()
            .returning(|_, _| {
                Box::pin(async { Ok(Some(secret(&[("aws_access_key_id", "AKIAEXAMPLE")]))) })
            })
            .once();

        let operator = operator(client, cloud_provider);
        let err = operator.context(&machine(&config)).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<ActuatorError>(),
            Some(&ActuatorError::InvalidCredentialsSecret(
                "aws-credentials".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn when_reconciling_read_credentials_secret_once() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.credentials_secret = Some(LocalObjectReference {
            name: "aws-credentials".to_string(),
        });

        let credentials = || {
            Some(AwsCredentials {
                access_key_id: "AKIAEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
            })
        };

        client
            .expect_get_secret()
            .with(eq("machine1_namespace"), eq("aws-credentials"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(Some(secret(&[
                        ("aws_access_key_id", "AKIAEXAMPLE"),
                        ("aws_secret_access_key", "secret"),
                    ])))
                })
            })
            .once();

        cloud_provider
            .expect_describe_instances()
            .withf(move |scope, _| scope.credentials == credentials())
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![
                        instance("i-1", InstanceState::Running, Some(1)),
                        instance("i-2", InstanceState::Running, Some(2)),
                    ])
                })
            })
            .times(2);

        cloud_provider
            .expect_terminate_instances()
            .withf(move |scope, ids| {
                scope.credentials == credentials() && *ids == vec!["i-1".to_string()]
            })
            .returning(|_, _| Box::pin(async { Ok(()) }))
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        operator.reconcile(Arc::new(machine(&config))).await.unwrap();
    }

    #[tokio::test]
    async fn when_created_register_instance_with_load_balancers() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.load_balancers = vec![LoadBalancerReference {
            name: "cluster-ext".to_string(),
            load_balancer_type: LoadBalancerType::Classic,
        }];

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| Box::pin(async { Ok(vec![]) }))
            .times(2);

        cloud_provider
            .expect_run_instance()
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Pending, None)]) })
            })
            .once();

        cloud_provider
            .expect_register_instances_with_load_balancer()
            .with(
                eq(scope()),
                eq("cluster-ext".to_string()),
                eq(vec!["i-1".to_string()]),
            )
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        operator.reconcile(Arc::new(machine(&config))).await.unwrap();
    }

    #[tokio::test]
    async fn when_load_balancer_registration_fails_on_update_keep_status_and_fail() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut config = config();
        config.load_balancers = vec![LoadBalancerReference {
            name: "cluster-net-lb".to_string(),
            load_balancer_type: LoadBalancerType::Network,
        }];

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| {
                Box::pin(async { Ok(vec![instance("i-1", InstanceState::Running, Some(1))]) })
            })
            .once();

        cloud_provider
            .expect_describe_load_balancer_arns()
            .returning(|_, _| Box::pin(async { Err(format_err!("LoadBalancerNotFound")) }))
            .once();

        client
            .expect_patch_machine_status()
            .withf(|_, status, _| aws_status(status).instance_id.as_deref() == Some("i-1"))
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config);
        let context = operator.context(&machine).await.unwrap();
        let err = operator.update(&context).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ActuatorError>(),
            Some(ActuatorError::LoadBalancerRegistration(id, _)) if id == "i-1"
        ));
    }

    #[tokio::test]
    async fn when_availability_zone_known_set_provider_id() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![Instance {
                        availability_zone: Some("us-east-1a".to_string()),
                        ..instance("i-1", InstanceState::Running, Some(1))
                    }])
                })
            })
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        client
            .expect_patch_machine_provider_id()
            .withf(|machine, provider_id| {
                machine.name_any() == "machine1" && provider_id == "aws:///us-east-1a/i-1"
            })
            .returning(|_, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let machine = machine(&config());
        let context = operator.context(&machine).await.unwrap();
        operator.update(&context).await.unwrap();
    }

    #[tokio::test]
    async fn when_provider_id_already_set_do_not_patch_it() {
        let mut client = MockKubeClient::new();
        let mut cloud_provider = MockCloudProvider::new();

        let mut machine = machine(&config());
        machine.spec.provider_id = Some("aws:///us-east-1a/i-1".to_string());

        cloud_provider
            .expect_describe_instances()
            .returning(|_, _| {
                Box::pin(async {
                    Ok(vec![Instance {
                        availability_zone: Some("us-east-1a".to_string()),
                        ..instance("i-1", InstanceState::Running, Some(1))
                    }])
                })
            })
            .once();

        client
            .expect_patch_machine_status()
            .returning(|_, _, _| Box::pin(async { Ok(()) }))
            .once();

        let operator = operator(client, cloud_provider);
        let context = operator.context(&machine).await.unwrap();
        operator.update(&context).await.unwrap();
    }

    #[test]
    fn when_reconcile_fails_requeue_after_error_period() {
        let operator = Operator {
            client: MockKubeClient::new().into(),
            cloud_provider: MockCloudProvider::new().into(),
            settings: ActuatorSettings {
                error_requeue_period: Duration::from_secs(45),
                ..Default::default()
            },
        };
        let err = finalizer::Error::ApplyFailed(OperatorError::Anyhow(format_err!("boom")));

        let action = Arc::new(operator).error_policy(Arc::new(machine(&config())), &err);

        assert_eq!(action, Action::requeue(Duration::from_secs(45)));
    }

    #[test]
    fn machine_addresses_in_fixed_order() {
        let instance = Instance {
            public_ip_address: Some("54.1.2.3".to_string()),
            ..instance("i-1", InstanceState::Running, None)
        };

        let addresses: Vec<(NodeAddressType, String)> = machine_addresses(&instance)
            .into_iter()
            .map(|a| (a.address_type, a.address))
            .collect();

        assert_eq!(
            addresses,
            vec![
                (NodeAddressType::ExternalIP, "54.1.2.3".to_string()),
                (NodeAddressType::InternalIP, "10.0.0.1".to_string()),
                (
                    NodeAddressType::InternalDNS,
                    "ip-10-0-0-1.ec2.internal".to_string()
                ),
            ]
        );
    }
}
