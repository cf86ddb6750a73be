//! External PFCP service
//!
//! The N4 interface is exposed through a `LoadBalancer` Service named
//! `<name>-external`. The N4 hostname published in status prefers the
//! configured hostname, then the load balancer's ingress hostname, then the
//! in-cluster service FQDN.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER, PFCP_PORT};

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Name of the external service of an instance
pub fn external_service_name(instance: &str) -> String {
    format!("{}-external", instance)
}

/// In-cluster FQDN of the external service
pub fn internal_hostname(instance: &str, namespace: &str) -> String {
    format!(
        "{}.{}.svc.cluster.local",
        external_service_name(instance),
        namespace
    )
}

/// Desired external service of `instance`
pub fn desired_service(instance: &str, namespace: &str) -> Service {
    let labels = BTreeMap::from([(APP_NAME_LABEL.to_string(), instance.to_string())]);
    Service {
        metadata: ObjectMeta {
            name: Some(external_service_name(instance)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("pfcp".to_string()),
                port: i32::from(PFCP_PORT),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            }]),
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// First ingress hostname of a load balancer service
pub fn load_balancer_hostname(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .hostname
        .clone()
}

/// Choose the N4 hostname
pub fn n4_hostname(
    configured: Option<&str>,
    load_balancer: Option<&str>,
    instance: &str,
    namespace: &str,
) -> String {
    configured
        .or(load_balancer)
        .map(str::to_string)
        .unwrap_or_else(|| internal_hostname(instance, namespace))
}

/// Lifecycle of the external service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalServiceClient: Send + Sync {
    /// Create the service when it does not exist
    async fn ensure(&self, instance: &str) -> Result<(), Error>;

    /// Delete the service; absence is not an error
    async fn delete(&self, instance: &str) -> Result<(), Error>;

    /// Ingress hostname assigned by the load balancer, if any
    async fn hostname(&self, instance: &str) -> Result<Option<String>, Error>;
}

/// Production client over `Api<Service>`
pub struct KubeExternalService {
    api: Api<Service>,
    namespace: String,
}

impl KubeExternalService {
    /// Create a client in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
        }
    }
}

#[async_trait]
impl ExternalServiceClient for KubeExternalService {
    async fn ensure(&self, instance: &str) -> Result<(), Error> {
        let name = external_service_name(instance);
        let existing = self
            .api
            .get_opt(&name)
            .await
            .map_err(|e| Error::from_kube("Service", &name, "get", e))?;
        if existing.is_some() {
            return Ok(());
        }
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api
            .create(&params, &desired_service(instance, &self.namespace))
            .await
            .map_err(|e| Error::from_kube("Service", &name, "create", e))?;
        info!(service = %name, "Created the external UPF service");
        Ok(())
    }

    async fn delete(&self, instance: &str) -> Result<(), Error> {
        let name = external_service_name(instance);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(service = %name, "Deleted external UPF service");
                Ok(())
            }
            Err(e) => match Error::from_kube("Service", &name, "delete", e) {
                err if err.is_not_found() => Ok(()),
                err => {
                    warn!(service = %name, error = %err, "Could not delete external UPF service");
                    Err(err)
                }
            },
        }
    }

    async fn hostname(&self, instance: &str) -> Result<Option<String>, Error> {
        let name = external_service_name(instance);
        let service = self
            .api
            .get_opt(&name)
            .await
            .map_err(|e| Error::from_kube("Service", &name, "get", e))?;
        Ok(service.as_ref().and_then(load_balancer_hostname))
    }
}
