use std::{cmp::Ordering, collections::HashSet};

use anyhow::{Context, Error};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::DateTime;
use kube::ResourceExt;

use crate::{
    cloud_provider::CloudProvider,
    error::ActuatorError,
    model::{
        cluster_id, AwsMachineProviderConfig, AwsResourceReference, AwsScope, Filter, Image,
        Instance, InstanceState, Machine, NetworkInterface, RunInstanceRequest, Tag,
    },
};

const TAG_NAME: &str = "Name";
const TAG_CLUSTER_ID: &str = "clusterid";
const FILTER_INSTANCE_STATE: &str = "instance-state-name";
const FILTER_AVAILABILITY_ZONE: &str = "availabilityZone";

/// Lists the instances tagged with the machine name and its cluster ID,
/// optionally narrowed to the given states.
pub async fn get_instances<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    machine: &Machine,
    states: &[InstanceState],
) -> Result<Vec<Instance>, Error> {
    let machine_name = machine.name_any();
    let cluster_id = cluster_id(machine)?;

    let mut filters = vec![
        Filter::new(&format!("tag:{TAG_NAME}"), &[machine_name.as_str()]),
        Filter::new(&format!("tag:{TAG_CLUSTER_ID}"), &[cluster_id]),
    ];
    if !states.is_empty() {
        let states: Vec<&str> = states.iter().map(InstanceState::as_str).collect();
        filters.push(Filter::new(FILTER_INSTANCE_STATE, &states));
    }

    cloud_provider.describe_instances(scope, filters).await
}

pub async fn get_running_instances<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    machine: &Machine,
) -> Result<Vec<Instance>, Error> {
    get_instances(cloud_provider, scope, machine, &InstanceState::RUNNING).await
}

pub async fn get_stopped_instances<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    machine: &Machine,
) -> Result<Vec<Instance>, Error> {
    get_instances(cloud_provider, scope, machine, &InstanceState::STOPPED).await
}

/// Terminates all given instances with a single request.
pub async fn terminate_instances<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    instances: &[Instance],
) -> Result<(), Error> {
    if instances.is_empty() {
        return Ok(());
    }

    let ids = instances
        .iter()
        .map(|instance| {
            tracing::info!(
                "Terminating instance {} (state: {:?}, launched: {:?})..",
                instance.id,
                instance.state.map(|s| s.as_str()),
                instance.launch_time
            );
            instance.id.clone()
        })
        .collect();

    cloud_provider
        .terminate_instances(scope, ids)
        .await
        .context("error terminating instances")
}

pub async fn remove_stopped_machine<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    machine: &Machine,
) -> Result<(), Error> {
    let instances = get_stopped_instances(cloud_provider, scope, machine)
        .await
        .context("error getting stopped instances")?;

    if instances.is_empty() {
        tracing::debug!("No stopped instances found for machine {}", machine.name_any());
        return Ok(());
    }

    terminate_instances(cloud_provider, scope, &instances).await
}

/// Orders instances newest first. An instance without a launch time has only
/// just been started, so it goes ahead of everything else.
pub fn sort_instances(instances: &mut [Instance]) {
    instances.sort_by(|a, b| match (&a.launch_time, &b.launch_time) {
        (Some(a), Some(b)) => b.cmp(a),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Splits off the newest instance from the ones that should be cleaned up.
pub fn split_newest(mut instances: Vec<Instance>) -> Option<(Instance, Vec<Instance>)> {
    sort_instances(&mut instances);
    if instances.is_empty() {
        None
    } else {
        let newest = instances.remove(0);
        Some((newest, instances))
    }
}

pub async fn get_ami<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    ami: &AwsResourceReference,
) -> Result<String, Error> {
    if let Some(id) = &ami.id {
        tracing::debug!("Using AMI {id}");
        return Ok(id.clone());
    }

    if ami.filters.is_empty() {
        return Err(ActuatorError::MissingAmi.into());
    }

    tracing::debug!("Describing AMI based on filters..");
    let images = cloud_provider
        .describe_images(scope, ami.filters.clone())
        .await
        .context("error describing AMI")?;

    Ok(latest_image(&images)?.id.clone())
}

fn latest_image(images: &[Image]) -> Result<&Image, ActuatorError> {
    let mut latest: Option<(&Image, DateTime<chrono::FixedOffset>)> = None;
    for image in images {
        let created = image
            .creation_date
            .as_deref()
            .ok_or_else(|| {
                ActuatorError::InvalidImageCreationDate(image.id.clone(), "missing".to_string())
            })
            .and_then(|date| {
                DateTime::parse_from_rfc3339(date).map_err(|e| {
                    ActuatorError::InvalidImageCreationDate(image.id.clone(), e.to_string())
                })
            })?;

        match latest {
            Some((_, latest_created)) if latest_created >= created => {}
            _ => latest = Some((image, created)),
        }
    }

    latest
        .map(|(image, _)| image)
        .ok_or(ActuatorError::NoImageFound)
}

pub async fn get_security_group_ids<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    security_groups: &[AwsResourceReference],
) -> Result<Vec<String>, Error> {
    let mut ids = vec![];
    for group in security_groups {
        if let Some(id) = &group.id {
            ids.push(id.clone());
        } else if !group.filters.is_empty() {
            tracing::debug!("Describing security groups based on filters..");
            let found = cloud_provider
                .describe_security_groups(scope, group.filters.clone())
                .await
                .context("error describing security groups")?;
            ids.extend(found);
        }
    }

    if ids.is_empty() {
        tracing::debug!("No security group found");
    }

    Ok(ids)
}

pub async fn get_subnet_ids<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    subnet: &AwsResourceReference,
    availability_zone: &str,
) -> Result<Vec<String>, Error> {
    let ids = if let Some(id) = &subnet.id {
        vec![id.clone()]
    } else {
        let mut filters = vec![];
        if !availability_zone.is_empty() {
            filters.push(Filter::new(FILTER_AVAILABILITY_ZONE, &[availability_zone]));
        }
        filters.extend(subnet.filters.iter().cloned());

        tracing::debug!("Describing subnets based on filters..");
        cloud_provider
            .describe_subnets(scope, filters)
            .await
            .context("error describing subnets")?
    };

    if ids.is_empty() {
        return Err(ActuatorError::NoSubnetFound.into());
    }

    Ok(ids)
}

/// Keeps the first tag for every key.
pub fn remove_duplicated_tags(tags: Vec<Tag>) -> Vec<Tag> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter(|tag| seen.insert(tag.key.clone()))
        .collect()
}

pub fn build_run_instance_request(
    machine: &Machine,
    config: &AwsMachineProviderConfig,
    image_id: String,
    security_group_ids: Vec<String>,
    subnet_ids: Vec<String>,
    user_data: &[u8],
) -> Result<RunInstanceRequest, Error> {
    let cluster_id = cluster_id(machine)?;
    let tenancy = config.placement.tenancy()?;

    if subnet_ids.len() > 1 {
        tracing::warn!("More than one subnet id returned, only first one will be used");
    }
    let subnet_id = subnet_ids
        .into_iter()
        .next()
        .ok_or(ActuatorError::NoSubnetFound)?;

    let mut instance_tags: Vec<Tag> = config
        .tags
        .iter()
        .map(|tag| Tag::new(&tag.name, &tag.value))
        .collect();
    instance_tags.extend([
        Tag::new(TAG_CLUSTER_ID, cluster_id),
        Tag::new(&format!("kubernetes.io/cluster/{cluster_id}"), "owned"),
        Tag::new(TAG_NAME, &machine.name_any()),
    ]);

    let availability_zone = Some(&config.placement.availability_zone)
        .filter(|az| !az.is_empty() && config.subnet.id.is_none())
        .cloned();

    let iam_instance_profile = config
        .iam_instance_profile
        .as_ref()
        .and_then(|profile| profile.id.clone());

    Ok(RunInstanceRequest {
        image_id,
        instance_type: config.instance_type.clone(),
        key_name: config.key_name.clone(),
        iam_instance_profile,
        instance_tags: remove_duplicated_tags(instance_tags),
        volume_tags: vec![Tag::new(TAG_CLUSTER_ID, cluster_id)],
        network_interface: NetworkInterface {
            device_index: config.device_index,
            associate_public_ip_address: config.public_ip,
            subnet_id,
            security_group_ids,
        },
        user_data: STANDARD.encode(user_data),
        availability_zone,
        tenancy,
    })
}

/// Launches exactly one instance for the machine.
pub async fn launch_instance<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    machine: &Machine,
    config: &AwsMachineProviderConfig,
    user_data: &[u8],
) -> Result<Instance, Error> {
    // Fail on bad input before any describe call is made.
    cluster_id(machine)?;
    config.placement.tenancy()?;

    let image_id = get_ami(cloud_provider, scope, &config.ami).await?;

    let security_group_ids =
        get_security_group_ids(cloud_provider, scope, &config.security_groups)
            .await
            .context("error getting security groups IDs")?;

    let subnet_ids = get_subnet_ids(
        cloud_provider,
        scope,
        &config.subnet,
        &config.placement.availability_zone,
    )
    .await
    .context("error getting subnet IDs")?;

    let request = build_run_instance_request(
        machine,
        config,
        image_id,
        security_group_ids,
        subnet_ids,
        user_data,
    )?;

    let mut instances = cloud_provider
        .run_instance(scope, &request)
        .await
        .context("error creating EC2 instance")?;

    if instances.len() != 1 {
        return Err(ActuatorError::UnexpectedReservation.into());
    }

    Ok(instances.remove(0))
}
