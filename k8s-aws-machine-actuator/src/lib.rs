pub mod client;
pub mod cloud_provider;
pub mod conditions;
pub mod error;
pub mod instances;
pub mod load_balancers;
pub mod model;
pub mod operator;
pub mod settings;
