use anyhow::{anyhow, Error};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};

use crate::model::{Machine, MachineStatus};

#[cfg(test)]
use mockall::automock;

#[trait_variant::make(Send)]
#[cfg_attr(test, automock)]
pub trait KubeClient {
    fn underlying_client(&self) -> &Client;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    async fn patch_machine_status(
        &self,
        machine: &Machine,
        status: &MachineStatus,
        manager: &str,
    ) -> Result<(), Error>;
    async fn patch_machine_provider_id(
        &self,
        machine: &Machine,
        provider_id: &str,
    ) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct DefaultKubeClient {
    pub client: Client,
}

impl KubeClient for DefaultKubeClient {
    fn underlying_client(&self) -> &Client {
        &self.client
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret)
    }

    async fn patch_machine_status(
        &self,
        machine: &Machine,
        status: &MachineStatus,
        manager: &str,
    ) -> Result<(), Error> {
        let machine_name = machine
            .metadata
            .name
            .as_ref()
            .ok_or(anyhow!("Missing machine name"))?;

        let machine_namespace = machine
            .metadata
            .namespace
            .as_ref()
            .ok_or(anyhow!("Missing machine namespace"))?;

        let api: Api<Machine> = Api::namespaced(self.client.clone(), machine_namespace);
        let patch = serde_json::json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "status": status
        });
        let patch = Patch::Apply(&patch);
        let params = PatchParams::apply(manager).force();
        api.patch_status(machine_name, &params, &patch).await?;

        Ok(())
    }

    async fn patch_machine_provider_id(
        &self,
        machine: &Machine,
        provider_id: &str,
    ) -> Result<(), Error> {
        let machine_name = machine
            .metadata
            .name
            .as_ref()
            .ok_or(anyhow!("Missing machine name"))?;

        let machine_namespace = machine
            .metadata
            .namespace
            .as_ref()
            .ok_or(anyhow!("Missing machine namespace"))?;

        let api: Api<Machine> = Api::namespaced(self.client.clone(), machine_namespace);
        let patch = serde_json::json!({
            "spec": {
                "providerID": provider_id
            }
        });
        let patch = Patch::Merge(&patch);
        api.patch(machine_name, &PatchParams::default(), &patch)
            .await?;

        Ok(())
    }
}
