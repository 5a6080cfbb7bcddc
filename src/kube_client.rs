use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};

use crate::error::CoreError;
use crate::waybill::{Waybill, WaybillStatus};

/// Ordered, de-duplicated `group/version/kind` strings a delegate is
/// allowed to prune, split by scope per spec.md §3/§4.2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunableKinds {
    pub cluster_scoped: Vec<String>,
    pub namespaced: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Abstraction over everything the core needs from the cluster API,
/// per spec.md §4.2. A trait so the Scheduler/Runner can be exercised in
/// tests against `MockKubeClient` without a real apiserver, the same role
/// the kube-rs ecosystem's own test tooling plays for the client library
/// itself, but realized here as a plain trait object seam rather than a
/// tower-service mock, since that's all the Scheduler/Runner need.
#[allow(async_fn_in_trait)]
pub trait KubeApiClient: Send + Sync {
    /// Cluster-wide list of Waybills, sorted by `(namespace, name)`, with
    /// at most one retained per namespace. Every extra Waybill in an
    /// already-represented namespace provokes a `Warning/MultipleWaybillsFound`
    /// event on itself, referring back to the retained one. See spec.md §4.2.
    async fn list_waybills(&self) -> Result<Vec<Waybill>, CoreError>;

    async fn get_waybill(&self, namespace: &str, name: &str) -> Result<Waybill, CoreError>;

    async fn update_waybill_status(
        &self,
        namespace: &str,
        name: &str,
        status: WaybillStatus,
    ) -> Result<(), CoreError>;

    /// Full Secret data, keyed by field name, decoded from base64.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>, CoreError>;

    /// Discovers deletable, non-subresource kinds and intersects them with
    /// what the namespace's delegate credentials can get+list+delete. The
    /// access checks run as the delegate (`delegate_kubeconfig`, the same
    /// rendered kubeconfig the Runner writes for `kubectl`), not as this
    /// client's own identity, per spec.md §4.2/§9.
    async fn prunable_resource_gvks(
        &self,
        namespace: &str,
        delegate_kubeconfig: &str,
    ) -> Result<PrunableKinds, CoreError>;

    async fn has_access(&self, namespace: &str, user: &str, verb: &str) -> Result<bool, CoreError>;

    async fn emit_waybill_event(
        &self,
        namespace: &str,
        name: &str,
        event_type: EventType,
        reason: &str,
        message: String,
    ) -> Result<(), CoreError>;
}

pub const FIELD_MANAGER: &str = "kube-applier";
pub const EVENT_SOURCE_COMPONENT: &str = "kube-applier";

/// Real implementation backed by `kube::Client`.
pub struct RealKubeClient {
    client: Client,
}

impl RealKubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn waybill_api(&self, namespace: &str) -> Api<Waybill> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl KubeApiClient for RealKubeClient {
    async fn list_waybills(&self) -> Result<Vec<Waybill>, CoreError> {
        let api: Api<Waybill> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| CoreError::Cluster(format!("listing Waybills: {e}")))?;

        let mut items: Vec<Waybill> = list.items;
        items.sort_by(|a, b| {
            (a.namespace().unwrap_or_default(), a.name_any())
                .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
        });

        let mut retained: HashMap<String, Waybill> = HashMap::new();
        let mut extras: Vec<Waybill> = Vec::new();
        for item in items {
            let ns = item.namespace().unwrap_or_default();
            if retained.contains_key(&ns) {
                extras.push(item);
            } else {
                retained.insert(ns, item);
            }
        }

        for extra in &extras {
            let ns = extra.namespace().unwrap_or_default();
            if let Some(kept) = retained.get(&ns) {
                self.emit_waybill_event(
                    &ns,
                    &extra.name_any(),
                    EventType::Warning,
                    "MultipleWaybillsFound",
                    format!(
                        "multiple Waybills found in namespace {ns:?}; only {:?} is active",
                        kept.name_any()
                    ),
                )
                .await
                .ok();
            }
        }

        let mut result: Vec<Waybill> = retained.into_values().collect();
        result.sort_by(|a, b| {
            (a.namespace().unwrap_or_default(), a.name_any())
                .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
        });
        Ok(result)
    }

    async fn get_waybill(&self, namespace: &str, name: &str) -> Result<Waybill, CoreError> {
        self.waybill_api(namespace)
            .get(name)
            .await
            .map_err(|e| CoreError::Cluster(format!("getting Waybill {namespace}/{name}: {e}")))
    }

    async fn update_waybill_status(
        &self,
        namespace: &str,
        name: &str,
        status: WaybillStatus,
    ) -> Result<(), CoreError> {
        let patch = serde_json::json!({ "status": status });
        self.waybill_api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| CoreError::Cluster(format!("updating status for {namespace}/{name}: {e}")))?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        use k8s_openapi::api::core::v1::Secret;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .map_err(|e| CoreError::Cluster(format!("getting secret {namespace}/{name}: {e}")))?;
        let data = secret.data.unwrap_or_default();
        Ok(data
            .into_iter()
            .map(|(k, ByteString(v))| (k, v))
            .collect())
    }

    async fn prunable_resource_gvks(
        &self,
        namespace: &str,
        delegate_kubeconfig: &str,
    ) -> Result<PrunableKinds, CoreError> {
        // Discovery itself runs under our own identity: enumerating which
        // kinds exist is not a privileged operation. Only the per-kind
        // access check below needs to reflect what the *delegate* can do.
        let discovery = kube::discovery::Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| CoreError::Cluster(format!("running API discovery: {e}")))?;

        let delegate_client = delegate_client_from_kubeconfig(delegate_kubeconfig).await?;

        let mut cluster_scoped = Vec::new();
        let mut namespaced = Vec::new();

        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.plural.contains('/') {
                    continue;
                }
                if !caps.supports_operation(kube::discovery::verbs::DELETE) {
                    continue;
                }
                let gvk = normalize_gvk(&ar.group, &ar.version, &ar.kind);
                if !delegate_can_prune(&delegate_client, namespace, &ar.group, &ar.version, &ar.plural).await? {
                    continue;
                }
                if caps.scope == kube::discovery::Scope::Cluster {
                    cluster_scoped.push(gvk);
                } else {
                    namespaced.push(gvk);
                }
            }
        }

        cluster_scoped.sort();
        cluster_scoped.dedup();
        namespaced.sort();
        namespaced.dedup();

        Ok(PrunableKinds {
            cluster_scoped,
            namespaced,
        })
    }

    async fn has_access(&self, namespace: &str, user: &str, verb: &str) -> Result<bool, CoreError> {
        let review = SelfSubjectAccessReview {
            metadata: ObjectMeta::default(),
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_owned()),
                    verb: Some(verb.to_owned()),
                    group: Some("kube-applier.io".to_owned()),
                    resource: Some("waybills".to_owned()),
                    ..Default::default()
                }),
                non_resource_attributes: None,
                user: Some(user.to_owned()),
                ..Default::default()
            },
            status: None,
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| CoreError::Cluster(format!("checking access for {user}: {e}")))?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn emit_waybill_event(
        &self,
        namespace: &str,
        name: &str,
        event_type: EventType,
        reason: &str,
        message: String,
    ) -> Result<(), CoreError> {
        use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-")),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Waybill".to_owned()),
                namespace: Some(namespace.to_owned()),
                name: Some(name.to_owned()),
                api_version: Some("kube-applier.io/v1".to_owned()),
                ..Default::default()
            },
            reason: Some(reason.to_owned()),
            message: Some(message),
            type_: Some(event_type.as_str().to_owned()),
            source: Some(EventSource {
                component: Some(EVENT_SOURCE_COMPONENT.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        api.create(&PostParams::default(), &event)
            .await
            .map_err(|e| CoreError::Cluster(format!("emitting event on {namespace}/{name}: {e}")))?;
        Ok(())
    }
}

/// Builds a `kube::Client` authenticated as the namespace's delegate,
/// parsed from the same rendered kubeconfig text the Runner writes to
/// disk for `kubectl` (`KubeConfig::render_delegate_kubeconfig`).
async fn delegate_client_from_kubeconfig(kubeconfig: &str) -> Result<Client, CoreError> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| CoreError::Cluster(format!("parsing delegate kubeconfig: {e}")))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| CoreError::Cluster(format!("building delegate kube config: {e}")))?;
    Client::try_from(config).map_err(|e| CoreError::Cluster(format!("constructing delegate kube client: {e}")))
}

/// Issues the `get`/`list`/`delete` `SelfSubjectAccessReview`s for one
/// resource as the given (delegate) client, per spec.md §4.2/§9: the
/// whitelist must reflect what the *delegate* can prune, not what this
/// process's own credentials can do.
async fn delegate_can_prune(
    delegate_client: &Client,
    namespace: &str,
    group: &str,
    _version: &str,
    resource: &str,
) -> Result<bool, CoreError> {
    for verb in ["get", "list", "delete"] {
        let review = SelfSubjectAccessReview {
            metadata: ObjectMeta::default(),
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_owned()),
                    verb: Some(verb.to_owned()),
                    group: Some(group.to_owned()),
                    resource: Some(resource.to_owned()),
                    ..Default::default()
                }),
                non_resource_attributes: None,
                ..Default::default()
            },
            status: None,
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(delegate_client.clone());
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| CoreError::Cluster(format!("access review for {resource}: {e}")))?;
        if !created.status.map(|s| s.allowed).unwrap_or(false) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn normalize_gvk(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("core/{version}/{kind}")
    } else {
        format!("{group}/{version}/{kind}")
    }
}

/// In-memory fake satisfying `KubeApiClient`, for unit-testing the
/// Scheduler/Runner without a real apiserver.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockKubeClient {
        pub waybills: Mutex<BTreeMap<(String, String), Waybill>>,
        pub secrets: Mutex<HashMap<(String, String), HashMap<String, Vec<u8>>>>,
        pub prunable: Mutex<HashMap<String, PrunableKinds>>,
        pub events: Mutex<Vec<(String, String, EventType, String, String)>>,
        pub access: Mutex<HashSet<(String, String, String)>>,
    }

    impl MockKubeClient {
        pub fn insert_waybill(&self, wb: Waybill) {
            let ns = wb.namespace().unwrap_or_default();
            let name = wb.name_any();
            self.waybills.lock().unwrap().insert((ns, name), wb);
        }
    }

    impl KubeApiClient for MockKubeClient {
        async fn list_waybills(&self) -> Result<Vec<Waybill>, CoreError> {
            let all = self.waybills.lock().unwrap();
            let mut by_ns: HashMap<String, Vec<&Waybill>> = HashMap::new();
            for ((ns, _), wb) in all.iter() {
                by_ns.entry(ns.clone()).or_default().push(wb);
            }
            let mut result = Vec::new();
            for (_ns, mut wbs) in by_ns {
                wbs.sort_by_key(|w| w.name_any());
                let (first, rest) = wbs.split_first().expect("non-empty group");
                result.push((*first).clone());
                for extra in rest {
                    self.events.lock().unwrap().push((
                        extra.namespace().unwrap_or_default(),
                        extra.name_any(),
                        EventType::Warning,
                        "MultipleWaybillsFound".to_owned(),
                        format!("multiple Waybills found, {:?} is active", first.name_any()),
                    ));
                }
            }
            result.sort_by(|a, b| {
                (a.namespace().unwrap_or_default(), a.name_any())
                    .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
            });
            Ok(result)
        }

        async fn get_waybill(&self, namespace: &str, name: &str) -> Result<Waybill, CoreError> {
            self.waybills
                .lock()
                .unwrap()
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
                .ok_or_else(|| CoreError::Cluster(format!("no such waybill {namespace}/{name}")))
        }

        async fn update_waybill_status(
            &self,
            namespace: &str,
            name: &str,
            status: WaybillStatus,
        ) -> Result<(), CoreError> {
            let mut all = self.waybills.lock().unwrap();
            let wb = all
                .get_mut(&(namespace.to_owned(), name.to_owned()))
                .ok_or_else(|| CoreError::Cluster(format!("no such waybill {namespace}/{name}")))?;
            wb.status = Some(status);
            Ok(())
        }

        async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>, CoreError> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
                .ok_or_else(|| CoreError::Cluster(format!("no such secret {namespace}/{name}")))
        }

        async fn prunable_resource_gvks(
            &self,
            namespace: &str,
            _delegate_kubeconfig: &str,
        ) -> Result<PrunableKinds, CoreError> {
            Ok(self
                .prunable
                .lock()
                .unwrap()
                .get(namespace)
                .cloned()
                .unwrap_or_default())
        }

        async fn has_access(&self, namespace: &str, user: &str, verb: &str) -> Result<bool, CoreError> {
            Ok(self
                .access
                .lock()
                .unwrap()
                .contains(&(namespace.to_owned(), user.to_owned(), verb.to_owned())))
        }

        async fn emit_waybill_event(
            &self,
            namespace: &str,
            name: &str,
            event_type: EventType,
            reason: &str,
            message: String,
        ) -> Result<(), CoreError> {
            self.events.lock().unwrap().push((
                namespace.to_owned(),
                name.to_owned(),
                event_type,
                reason.to_owned(),
                message,
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockKubeClient;
    use super::*;
    use crate::waybill::{SecretReference, WaybillSpec};
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, name: &str) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: WaybillSpec {
                auto_apply: true,
                dry_run: false,
                prune: true,
                prune_cluster_resources: false,
                prune_blacklist: vec![],
                repository_path: String::new(),
                run_interval: 3600,
                server_side_apply: false,
                strongbox_keyring_secret_ref: None,
                git_ssh_secret_ref: None,
                delegate_service_account_secret_ref: SecretReference {
                    namespace: namespace.to_owned(),
                    name: "delegate-token".to_owned(),
                },
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn list_waybills_retains_first_by_name_and_flags_extras() {
        let mock = MockKubeClient::default();
        mock.insert_waybill(waybill("dup", "a"));
        mock.insert_waybill(waybill("dup", "b"));

        let listed = mock.list_waybills().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "a");

        let events = mock.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, "b");
        assert_eq!(events[0].3, "MultipleWaybillsFound");
    }

    #[tokio::test]
    async fn get_waybill_returns_not_found_error() {
        let mock = MockKubeClient::default();
        let result = mock.get_waybill("missing", "name").await;
        assert!(result.is_err());
    }
}
