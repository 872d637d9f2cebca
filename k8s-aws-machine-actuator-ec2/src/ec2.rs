use std::collections::HashMap;

use anyhow::{Context, Error};
use aws_config::SdkConfig;
use aws_sdk_ec2::{
    config::{Credentials, Region, SharedCredentialsProvider},
    types::{
        Filter as Ec2Filter, IamInstanceProfileSpecification, Instance as Ec2Instance,
        InstanceNetworkInterfaceSpecification, InstanceType, Placement, ResourceType,
        Tag as Ec2Tag, TagSpecification, Tenancy as Ec2Tenancy,
    },
};
use aws_sdk_elasticloadbalancing::types::Instance as ElbInstance;
use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetTypeEnum};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use k8s_aws_machine_actuator::cloud_provider::CloudProvider;
use k8s_aws_machine_actuator::model::{
    AwsCredentials, AwsScope, Filter, Image, Instance, InstanceState, RunInstanceRequest, Tag,
    TargetGroup, TargetType,
};

const CREDENTIALS_PROVIDER_NAME: &str = "machine-credentials-secret";

/// Cache key for per-scope clients. The secret key is left out so a rotated
/// secret replaces the cached clients instead of adding new ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    region: String,
    access_key_id: Option<String>,
}

impl From<&AwsScope> for ClientKey {
    fn from(scope: &AwsScope) -> Self {
        ClientKey {
            region: scope.region.clone(),
            access_key_id: scope
                .credentials
                .as_ref()
                .map(|credentials| credentials.access_key_id.clone()),
        }
    }
}

#[derive(Clone)]
struct Clients {
    ec2: aws_sdk_ec2::Client,
    elb: aws_sdk_elasticloadbalancing::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
}

struct CachedClients {
    credentials: Option<AwsCredentials>,
    clients: Clients,
}

/// EC2 and ELB backed cloud provider. Clients are built lazily, one set per
/// region and access key, on top of the process wide AWS configuration.
pub struct Ec2 {
    base_config: SdkConfig,
    clients: Mutex<HashMap<ClientKey, CachedClients>>,
}

impl Ec2 {
    pub fn new(base_config: SdkConfig) -> Self {
        Ec2 {
            base_config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients(&self, scope: &AwsScope) -> Clients {
        let mut clients = self.clients.lock().await;
        let key = ClientKey::from(scope);
        if let Some(cached) = clients.get(&key) {
            if cached.credentials == scope.credentials {
                return cached.clients.clone();
            }
            tracing::debug!("Credentials changed for {:?}, rebuilding clients", key);
        }

        tracing::debug!("Creating AWS clients for region {:?}", scope.region);
        let config = scoped_config(&self.base_config, scope);
        let scoped = Clients {
            ec2: aws_sdk_ec2::Client::new(&config),
            elb: aws_sdk_elasticloadbalancing::Client::new(&config),
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&config),
        };

        clients.insert(
            key,
            CachedClients {
                credentials: scope.credentials.clone(),
                clients: scoped.clone(),
            },
        );
        scoped
    }

    async fn client(&self, scope: &AwsScope) -> aws_sdk_ec2::Client {
        self.clients(scope).await.ec2
    }
}

/// The base configuration with the region and static credentials of the scope
/// applied. An empty region keeps the process default.
fn scoped_config(base_config: &SdkConfig, scope: &AwsScope) -> SdkConfig {
    let mut builder = base_config.to_builder();
    if !scope.region.is_empty() {
        builder = builder.region(Region::new(scope.region.clone()));
    }
    if let Some(credentials) = &scope.credentials {
        builder = builder.credentials_provider(SharedCredentialsProvider::new(Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        )));
    }
    builder.build()
}

impl CloudProvider for Ec2 {
    async fn describe_instances(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<Instance>, Error> {
        let output = self
            .client(scope)
            .await
            .describe_instances()
            .set_filters(Some(to_ec2_filters(filters)))
            .send()
            .await
            .context("error describing instances")?;

        let instances = output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(from_ec2_instance)
            .collect();
        Ok(instances)
    }

    async fn describe_images(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<Image>, Error> {
        let output = self
            .client(scope)
            .await
            .describe_images()
            .set_filters(Some(to_ec2_filters(filters)))
            .send()
            .await
            .context("error describing images")?;

        let images = output
            .images()
            .iter()
            .filter_map(|image| {
                Some(Image {
                    id: image.image_id()?.to_string(),
                    creation_date: image.creation_date().map(str::to_string),
                })
            })
            .collect();
        Ok(images)
    }

    async fn describe_security_groups(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<String>, Error> {
        let output = self
            .client(scope)
            .await
            .describe_security_groups()
            .set_filters(Some(to_ec2_filters(filters)))
            .send()
            .await
            .context("error describing security groups")?;

        let ids = output
            .security_groups()
            .iter()
            .filter_map(|group| group.group_id().map(str::to_string))
            .collect();
        Ok(ids)
    }

    async fn describe_subnets(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<String>, Error> {
        let output = self
            .client(scope)
            .await
            .describe_subnets()
            .set_filters(Some(to_ec2_filters(filters)))
            .send()
            .await
            .context("error describing subnets")?;

        let ids = output
            .subnets()
            .iter()
            .filter_map(|subnet| subnet.subnet_id().map(str::to_string))
            .collect();
        Ok(ids)
    }

    async fn run_instance(
        &self,
        scope: &AwsScope,
        request: &RunInstanceRequest,
    ) -> Result<Vec<Instance>, Error> {
        let network_interface = &request.network_interface;
        let mut run = self
            .client(scope)
            .await
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .set_key_name(request.key_name.clone())
            .tag_specifications(to_tag_specification(
                ResourceType::Instance,
                &request.instance_tags,
            ))
            .tag_specifications(to_tag_specification(
                ResourceType::Volume,
                &request.volume_tags,
            ))
            .network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .device_index(network_interface.device_index)
                    .set_associate_public_ip_address(network_interface.associate_public_ip_address)
                    .subnet_id(&network_interface.subnet_id)
                    .set_groups(Some(network_interface.security_group_ids.clone()))
                    .build(),
            )
            .set_user_data(Some(request.user_data.clone()).filter(|data| !data.is_empty()));

        if let Some(profile) = &request.iam_instance_profile {
            run = run.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }

        if request.availability_zone.is_some() || request.tenancy.is_some() {
            run = run.placement(
                Placement::builder()
                    .set_availability_zone(request.availability_zone.clone())
                    .set_tenancy(request.tenancy.map(|t| Ec2Tenancy::from(t.as_str())))
                    .build(),
            );
        }

        let output = run.send().await.context("error running instance")?;
        let instances = output.instances().iter().map(from_ec2_instance).collect();
        Ok(instances)
    }

    async fn terminate_instances(&self, scope: &AwsScope, ids: Vec<String>) -> Result<(), Error> {
        let output = self
            .client(scope)
            .await
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .context("error terminating instances")?;

        for change in output.terminating_instances() {
            tracing::debug!(
                "Instance {} is now {:?}",
                change.instance_id().unwrap_or_default(),
                change
                    .current_state()
                    .and_then(|state| state.name())
                    .map(|name| name.as_str())
            );
        }
        Ok(())
    }

    async fn register_instances_with_load_balancer(
        &self,
        scope: &AwsScope,
        load_balancer_name: String,
        instance_ids: Vec<String>,
    ) -> Result<(), Error> {
        let instances = instance_ids
            .into_iter()
            .map(|id| ElbInstance::builder().instance_id(id).build())
            .collect();

        self.clients(scope)
            .await
            .elb
            .register_instances_with_load_balancer()
            .load_balancer_name(&load_balancer_name)
            .set_instances(Some(instances))
            .send()
            .await
            .with_context(|| format!("error registering with load balancer {load_balancer_name}"))?;
        Ok(())
    }

    async fn describe_load_balancer_arns(
        &self,
        scope: &AwsScope,
        names: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        let output = self
            .clients(scope)
            .await
            .elbv2
            .describe_load_balancers()
            .set_names(Some(names))
            .send()
            .await
            .context("error describing load balancers")?;

        let arns = output
            .load_balancers()
            .iter()
            .filter_map(|lb| lb.load_balancer_arn().map(str::to_string))
            .collect();
        Ok(arns)
    }

    async fn describe_target_groups(
        &self,
        scope: &AwsScope,
        load_balancer_arn: String,
    ) -> Result<Vec<TargetGroup>, Error> {
        let output = self
            .clients(scope)
            .await
            .elbv2
            .describe_target_groups()
            .load_balancer_arn(&load_balancer_arn)
            .send()
            .await
            .with_context(|| format!("error describing target groups of {load_balancer_arn}"))?;

        let target_groups = output
            .target_groups()
            .iter()
            .filter_map(|group| {
                Some(TargetGroup {
                    arn: group.target_group_arn()?.to_string(),
                    target_type: group.target_type().and_then(from_target_type),
                })
            })
            .collect();
        Ok(target_groups)
    }

    async fn register_targets(
        &self,
        scope: &AwsScope,
        target_group_arn: String,
        target_ids: Vec<String>,
    ) -> Result<(), Error> {
        let targets = target_ids
            .into_iter()
            .map(|id| TargetDescription::builder().id(id).build())
            .collect::<Result<Vec<_>, _>>()?;

        self.clients(scope)
            .await
            .elbv2
            .register_targets()
            .target_group_arn(&target_group_arn)
            .set_targets(Some(targets))
            .send()
            .await
            .with_context(|| format!("error registering targets with {target_group_arn}"))?;
        Ok(())
    }
}

fn to_ec2_filters(filters: Vec<Filter>) -> Vec<Ec2Filter> {
    filters
        .into_iter()
        .map(|filter| {
            Ec2Filter::builder()
                .name(filter.name)
                .set_values(Some(filter.values))
                .build()
        })
        .collect()
}

fn to_tag_specification(resource_type: ResourceType, tags: &[Tag]) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .set_tags(Some(
            tags.iter()
                .map(|tag| Ec2Tag::builder().key(&tag.key).value(&tag.value).build())
                .collect(),
        ))
        .build()
}

fn from_target_type(target_type: &TargetTypeEnum) -> Option<TargetType> {
    match target_type {
        TargetTypeEnum::Instance => Some(TargetType::Instance),
        TargetTypeEnum::Ip => Some(TargetType::Ip),
        _ => None,
    }
}

fn from_ec2_instance(instance: &Ec2Instance) -> Instance {
    let non_empty = |value: Option<&str>| value.filter(|v| !v.is_empty()).map(str::to_string);

    Instance {
        id: instance.instance_id().unwrap_or_default().to_string(),
        state: instance
            .state()
            .and_then(|state| state.name())
            .and_then(|name| InstanceState::from_name(name.as_str())),
        launch_time: instance
            .launch_time()
            .and_then(|time| DateTime::<Utc>::from_timestamp(time.secs(), time.subsec_nanos())),
        public_ip_address: non_empty(instance.public_ip_address()),
        private_ip_address: non_empty(instance.private_ip_address()),
        public_dns_name: non_empty(instance.public_dns_name()),
        private_dns_name: non_empty(instance.private_dns_name()),
        availability_zone: non_empty(
            instance
                .placement()
                .and_then(|placement| placement.availability_zone()),
        ),
    }
}
