use anyhow::Error;

use crate::{
    cloud_provider::CloudProvider,
    error::ActuatorError,
    model::{AwsScope, Instance, LoadBalancerReference, LoadBalancerType, TargetType},
};

/// Registers the instance with every load balancer of the machine.
///
/// Classic load balancers take the instance id directly. Network load
/// balancers are resolved to their target groups, which take either the
/// instance id or its private IP depending on the target type. Every
/// registration is attempted and the failures are reported together.
pub async fn register_with_load_balancers<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    load_balancers: &[LoadBalancerReference],
    instance: &Instance,
) -> Result<(), Error> {
    if load_balancers.is_empty() {
        return Ok(());
    }

    let (classic, network): (Vec<_>, Vec<_>) = load_balancers
        .iter()
        .partition(|lb| lb.load_balancer_type == LoadBalancerType::Classic);

    let mut errors = vec![];

    for lb in classic {
        tracing::debug!(
            "Registering instance {} with classic load balancer {}..",
            instance.id,
            lb.name
        );
        if let Err(err) = cloud_provider
            .register_instances_with_load_balancer(scope, lb.name.clone(), vec![instance.id.clone()])
            .await
        {
            errors.push(format!("{}: {err:#}", lb.name));
        }
    }

    if !network.is_empty() {
        let names = network.iter().map(|lb| lb.name.clone()).collect();
        register_with_network_load_balancers(cloud_provider, scope, names, instance, &mut errors)
            .await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ActuatorError::LoadBalancerRegistration(instance.id.clone(), errors.join("; ")).into())
    }
}

async fn register_with_network_load_balancers<P: CloudProvider>(
    cloud_provider: &P,
    scope: &AwsScope,
    names: Vec<String>,
    instance: &Instance,
    errors: &mut Vec<String>,
) {
    let arns = match cloud_provider
        .describe_load_balancer_arns(scope, names.clone())
        .await
    {
        Ok(arns) => arns,
        Err(err) => {
            errors.push(format!("{}: {err:#}", names.join(", ")));
            return;
        }
    };

    for arn in arns {
        let target_groups = match cloud_provider.describe_target_groups(scope, arn.clone()).await {
            Ok(target_groups) => target_groups,
            Err(err) => {
                errors.push(format!("{arn}: {err:#}"));
                continue;
            }
        };

        for target_group in target_groups {
            let target_id = match target_group.target_type {
                Some(TargetType::Instance) => instance.id.clone(),
                Some(TargetType::Ip) => match &instance.private_ip_address {
                    Some(ip) => ip.clone(),
                    None => {
                        errors.push(format!("{}: instance has no private IP", target_group.arn));
                        continue;
                    }
                },
                None => {
                    tracing::warn!(
                        "Target group {} has an unsupported target type, skipping",
                        target_group.arn
                    );
                    continue;
                }
            };

            tracing::debug!(
                "Registering {} with target group {}..",
                target_id,
                target_group.arn
            );
            if let Err(err) = cloud_provider
                .register_targets(scope, target_group.arn.clone(), vec![target_id])
                .await
            {
                errors.push(format!("{}: {err:#}", target_group.arn));
            }
        }
    }
}
