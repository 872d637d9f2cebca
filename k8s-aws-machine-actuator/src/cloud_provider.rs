use crate::model::{AwsScope, Filter, Image, Instance, RunInstanceRequest, TargetGroup};
use anyhow::Error;

#[cfg(test)]
use mockall::automock;

/// The slice of the EC2 API the actuator relies on. Every call is made within
/// a scope (region and optional static credentials) taken from the machine.
#[trait_variant::make(Send)]
#[cfg_attr(test, automock)]
pub trait CloudProvider {
    async fn describe_instances(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<Instance>, Error>;
    async fn describe_images(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<Image>, Error>;
    async fn describe_security_groups(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<String>, Error>;
    async fn describe_subnets(
        &self,
        scope: &AwsScope,
        filters: Vec<Filter>,
    ) -> Result<Vec<String>, Error>;
    async fn run_instance(
        &self,
        scope: &AwsScope,
        request: &RunInstanceRequest,
    ) -> Result<Vec<Instance>, Error>;
    async fn terminate_instances(&self, scope: &AwsScope, ids: Vec<String>) -> Result<(), Error>;

    /// Classic ELB registration by instance id.
    async fn register_instances_with_load_balancer(
        &self,
        scope: &AwsScope,
        load_balancer_name: String,
        instance_ids: Vec<String>,
    ) -> Result<(), Error>;
    /// ARNs of the named network load balancers.
    async fn describe_load_balancer_arns(
        &self,
        scope: &AwsScope,
        names: Vec<String>,
    ) -> Result<Vec<String>, Error>;
    async fn describe_target_groups(
        &self,
        scope: &AwsScope,
        load_balancer_arn: String,
    ) -> Result<Vec<TargetGroup>, Error>;
    async fn register_targets(
        &self,
        scope: &AwsScope,
        target_group_arn: String,
        target_ids: Vec<String>,
    ) -> Result<(), Error>;
}
