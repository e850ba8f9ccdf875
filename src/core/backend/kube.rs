//! Kubernetes custom-resource client for `agents.algoluna.com/v1alpha1`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{BackendError, LabelSelector, OrchestrationBackend, selector_query};
use crate::core::config::BackendConfig;
use crate::core::types::{WorkerPhase, WorkerRecord, WorkerSpec};

const GROUP: &str = "agents.algoluna.com";
const VERSION: &str = "v1alpha1";
const PLURAL: &str = "agents";
const KIND: &str = "Agent";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentResource {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    metadata: ObjectMeta,
    spec: AgentSpecBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<AgentStatusBody>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentSpecBody {
    #[serde(rename = "type")]
    agent_type: String,
    image: String,
    #[serde(default)]
    run_once: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_activity_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentStatusBody {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AgentList {
    #[serde(default)]
    items: Vec<AgentResource>,
}

impl AgentResource {
    fn from_spec(spec: &WorkerSpec, namespace: &str) -> Self {
        Self {
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: spec.name.clone(),
                namespace: Some(namespace.to_string()),
                labels: spec.labels.clone(),
                creation_timestamp: None,
            },
            spec: AgentSpecBody {
                agent_type: spec.worker_type.clone(),
                image: spec.image.clone(),
                run_once: spec.run_once,
                env: spec
                    .env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                service_account_name: spec.service_account.clone(),
                ttl: spec.ttl_seconds,
                last_activity_time: None,
            },
            status: None,
        }
    }

    fn into_record(self) -> WorkerRecord {
        let status = self.status.unwrap_or_default();
        WorkerRecord {
            spec: WorkerSpec {
                name: self.metadata.name,
                worker_type: self.spec.agent_type,
                image: self.spec.image,
                run_once: self.spec.run_once,
                env: self
                    .spec
                    .env
                    .into_iter()
                    .map(|e| (e.name, e.value))
                    .collect(),
                service_account: self.spec.service_account_name,
                ttl_seconds: self.spec.ttl.filter(|t| *t > 0),
                labels: self.metadata.labels,
            },
            last_activity_time: self.spec.last_activity_time,
            created_at: self.metadata.creation_timestamp,
            phase: if status.phase.is_empty() {
                WorkerPhase::Pending
            } else {
                WorkerPhase::from_status(&status.phase)
            },
            message: Some(status.message).filter(|m| !m.is_empty()),
        }
    }
}

pub struct KubeBackend {
    client: Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubeBackend {
    /// Build a client from config, picking up the in-cluster service-account
    /// token and CA bundle when they exist.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if config.ca_path.exists() {
            let pem = std::fs::read(&config.ca_path)
                .with_context(|| format!("reading CA bundle {}", config.ca_path.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let token = if config.token_path.exists() {
            Some(
                std::fs::read_to_string(&config.token_path)
                    .with_context(|| format!("reading token {}", config.token_path.display()))?
                    .trim()
                    .to_string(),
            )
        } else {
            None
        };
        info!(
            "Orchestration backend: {} (namespace {}, token {})",
            config.api_server,
            config.namespace,
            if token.is_some() { "present" } else { "absent" }
        );
        Ok(Self {
            client: builder.build()?,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token,
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}",
            self.api_server, GROUP, VERSION, self.namespace, PLURAL
        )
    }

    fn item_url(&self, name: &str) -> String {
        format!("{}/{}", self.collection_url(), name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        name: &str,
    ) -> Result<Response, BackendError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        check_status(response, name).await
    }
}

async fn check_status(response: Response, name: &str) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(BackendError::NotFound(name.to_string())),
        StatusCode::CONFLICT => Err(BackendError::Conflict(name.to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait]
impl OrchestrationBackend for KubeBackend {
    async fn create(&self, spec: &WorkerSpec) -> Result<(), BackendError> {
        let body = AgentResource::from_spec(spec, &self.namespace);
        self.send(self.client.post(self.collection_url()).json(&body), &spec.name)
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.send(self.client.delete(self.item_url(name)), name)
            .await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<WorkerRecord, BackendError> {
        let response = self.send(self.client.get(self.item_url(name)), name).await?;
        let resource: AgentResource = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(resource.into_record())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkerRecord>, BackendError> {
        let mut request = self.client.get(self.collection_url());
        if !selector.is_empty() {
            request = request.query(&[("labelSelector", selector_query(selector))]);
        }
        let response = self.send(request, PLURAL).await?;
        let list: AgentList = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(list.items.into_iter().map(AgentResource::into_record).collect())
    }

    async fn touch(&self, name: &str, at: DateTime<Utc>) -> Result<(), BackendError> {
        let patch = serde_json::json!({ "spec": { "lastActivityTime": at.to_rfc3339() } });
        debug!("Patching lastActivityTime on {}", name);
        self.send(
            self.client
                .patch(self.item_url(name))
                .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
                .body(patch.to_string()),
            name,
        )
        .await?;
        Ok(())
    }
}
