#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("unable to get cluster ID for machine: {0:?}")]
    MissingClusterId(String),

    #[error("AMI ID or AMI filters need to be specified")]
    MissingAmi,

    #[error("no image for given filters found")]
    NoImageFound,

    #[error("unable to parse time for {0:?} AMI: {1}")]
    InvalidImageCreationDate(String, String),

    #[error("no subnet IDs were found")]
    NoSubnetFound,

    #[error("invalid instance tenancy: {0}. Allowed options are: default, dedicated, host")]
    InvalidTenancy(String),

    #[error("unexpected reservation creating instance")]
    UnexpectedReservation,

    #[error("user data secret {0:?} not found")]
    MissingUserDataSecret(String),

    #[error("credentials secret {0:?} not found or incomplete")]
    InvalidCredentialsSecret(String),

    #[error("attempted to update machine but no instances found")]
    NoInstancesToUpdate,

    #[error("failed to register instance {0} with load balancers: {1}")]
    LoadBalancerRegistration(String, String),
}
