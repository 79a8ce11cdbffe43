use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::util::Error;

pub mod pb {
    tonic::include_proto!("sandbox.compute.v1");
}

/// An instance the external compute provider currently considers paused,
/// mirroring a `pb::PausedInstance` without tying callers to the generated
/// wire type.
#[derive(Clone, Debug, PartialEq)]
pub struct PausedInstance {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub uuid: String,
    pub annotations: BTreeMap<String, String>,
}

/// Callbacks into the external compute provider (§4.9). The GC sweep and the
/// deletion-path finalizer-release reconciler depend on this trait, not on
/// the concrete gRPC stub, so both are testable with a fake.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn delete_instance(&self, id: &str) -> Result<bool, Error>;
    async fn list_paused_instances(&self) -> Result<Vec<PausedInstance>, Error>;
}

pub struct GrpcComputeProvider {
    client: pb::compute_provider_client::ComputeProviderClient<tonic::transport::Channel>,
}

impl GrpcComputeProvider {
    pub async fn connect(endpoint: &str) -> Result<Self, Error> {
        let channel = tonic::transport::Channel::from_shared(endpoint.to_string())
            .map_err(|e| Error::UserInput(format!("invalid provider endpoint {endpoint:?}: {e}")))?
            .connect()
            .await?;
        Ok(GrpcComputeProvider { client: pb::compute_provider_client::ComputeProviderClient::new(channel) })
    }
}

#[async_trait]
impl ComputeProvider for GrpcComputeProvider {
    async fn delete_instance(&self, id: &str) -> Result<bool, Error> {
        let mut client = self.client.clone();
        let response = client.delete_instance(pb::DeleteInstanceRequest { id: id.to_string() }).await?;
        Ok(response.into_inner().deleted)
    }

    async fn list_paused_instances(&self) -> Result<Vec<PausedInstance>, Error> {
        let mut client = self.client.clone();
        let mut stream = client.list_paused_instances(pb::ListPausedInstancesRequest {}).await?.into_inner();
        let mut instances = Vec::new();
        while let Some(item) = stream.next().await {
            let item = item?;
            instances.push(PausedInstance {
                id: item.id,
                namespace: item.namespace,
                name: item.name,
                uuid: item.uuid,
                annotations: item.annotations.into_iter().collect(),
            });
        }
        Ok(instances)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeProvider {
        pub instances: Vec<PausedInstance>,
        pub deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        async fn delete_instance(&self, id: &str) -> Result<bool, Error> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(true)
        }

        async fn list_paused_instances(&self) -> Result<Vec<PausedInstance>, Error> {
            Ok(self.instances.clone())
        }
    }
}
