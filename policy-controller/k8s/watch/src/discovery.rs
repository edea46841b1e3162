use gatekeeper_policy_controller_k8s_api as k8s;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The group-version is not served by the API server. The kind may
    /// exist later, once its CRD installs.
    #[error("group version {0} is not registered with the API server")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Answers which kinds the API server actually serves for a group-version.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn server_kinds(&self, group: &str, version: &str)
        -> Result<Vec<String>, DiscoveryError>;
}

pub struct ApiServerDiscovery {
    client: k8s::Client,
}

impl ApiServerDiscovery {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Discovery for ApiServerDiscovery {
    async fn server_kinds(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{group}/{version}")
        };

        let list = self
            .client
            .list_api_group_resources(&api_version)
            .await
            .map_err(|error| match &error {
                kube::Error::Api(rsp) if rsp.reason == "NotFound" || rsp.code == 404 => {
                    DiscoveryError::NotFound(api_version.clone())
                }
                _ => DiscoveryError::Other(error.into()),
            })?;

        Ok(list.resources.into_iter().map(|r| r.kind).collect())
    }
}
