mod ec2;

use anyhow::Error;
use ec2::Ec2;
use k8s_aws_machine_actuator::{
    client::DefaultKubeClient, operator::Operator, settings::ActuatorSettings,
};
use kube::Client;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    tracing::debug!("Starting..");

    let client = Client::try_default().await?;
    let client = DefaultKubeClient { client };
    let client = Arc::new(client);

    let settings: ActuatorSettings = de_env::from_env()?;
    tracing::debug!("Using settings {:?}", settings);

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let cloud_provider = Ec2::new(aws_config);
    let cloud_provider = Arc::new(cloud_provider);

    let operator = Operator {
        client,
        cloud_provider,
        settings,
    };

    operator.run().await?;

    tracing::debug!("Terminating..");

    Ok(())
}
