//! Drives each rollout through its worker pod: creates the pod, mirrors its
//! phase into the rollout status and cleans up once the rollout is done.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, error, info, warn};

use crate::cache::{EventHandler, Lister};
use crate::codec::ConfigCodec;
use crate::config::DeployerSettings;
use crate::deployutil::{
    config_name_for, decode_config, deployer_pod_name, deployer_pod_selector, is_cancelled,
    label_for_rollout, replicas_for, rollout_name_for_pod, set_replicas, status_for,
    CANCELLED_ANNOTATION, CONFIG_ANNOTATION, DEPLOYER_POD_ANNOTATION,
    DEPLOYER_POD_FOR_DEPLOYMENT_LABEL, DEPLOYMENT_ANNOTATION, REASON_CANCELLED_BY_USER,
    REASON_DEPLOYER_POD_NO_LONGER_EXISTS, REASON_NEWER_DEPLOYMENT_EXISTS,
    REASON_UNRELATED_DEPLOYMENT_EXISTS, STATUS_ANNOTATION, STATUS_REASON_ANNOTATION,
};
use crate::error::ReconcileError;
use crate::events::{emit, EventRecorder, EventType};
use crate::models::{
    remove_annotation, set_annotation, DeploymentStrategy, Object, ObjectKey, Rollout, RolloutStatus,
};
use crate::storage::ObjectClient;
use crate::workqueue::WorkQueue;

/// Upper bound on a rollout's runtime when the strategy sets none.
pub const MAX_DEPLOYMENT_DURATION_SECONDS: i64 = 21600;

const DEPLOYER_CONTAINER_NAME: &str = "deployment";

pub struct DeployerController {
    rollouts: Arc<dyn ObjectClient<Rollout>>,
    pods: Arc<dyn ObjectClient<Pod>>,
    rollout_lister: Arc<dyn Lister<Rollout>>,
    pod_lister: Arc<dyn Lister<Pod>>,
    codec: Arc<dyn ConfigCodec>,
    recorder: Arc<dyn EventRecorder>,
    queue: WorkQueue<ObjectKey>,
    settings: DeployerSettings,
}

impl DeployerController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rollouts: Arc<dyn ObjectClient<Rollout>>,
        pods: Arc<dyn ObjectClient<Pod>>,
        rollout_lister: Arc<dyn Lister<Rollout>>,
        pod_lister: Arc<dyn Lister<Pod>>,
        codec: Arc<dyn ConfigCodec>,
        recorder: Arc<dyn EventRecorder>,
        settings: DeployerSettings,
    ) -> Self {
        Self {
            rollouts,
            pods,
            rollout_lister,
            pod_lister,
            codec,
            recorder,
            queue: WorkQueue::new(),
            settings,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn rollout_handler(&self) -> Arc<dyn EventHandler<Rollout>> {
        Arc::new(RolloutEvents {
            queue: self.queue.clone(),
        })
    }

    pub fn pod_handler(&self) -> Arc<dyn EventHandler<Pod>> {
        Arc::new(PodEvents {
            queue: self.queue.clone(),
            rollouts: self.rollout_lister.clone(),
        })
    }

    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(workers, "starting deployer controller");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next_work_item().await {} })
            })
            .collect();
        futures::future::join_all(handles).await;
        info!("deployer controller stopped");
    }

    /// Handles one key. Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let rollout = self.rollout_lister.get(&key.namespace, &key.name);
        let result = match &rollout {
            Some(rollout) => {
                let stale = self.queue.num_requeues(&key)
                    >= self.settings.max_retries.saturating_sub(2);
                self.handle(rollout, stale).await
            }
            None => {
                debug!(rollout = %key, "rollout no longer exists");
                Ok(())
            }
        };
        self.handle_err(result, &key, rollout.as_ref()).await;
        self.queue.done(&key);
        true
    }

    /// Moves `rollout` one step through its lifecycle. `is_cache_stale` says
    /// whether a worker pod missing from the cache should be believed.
    pub async fn handle(&self, rollout: &Rollout, is_cache_stale: bool) -> Result<(), ReconcileError> {
        let label = label_for_rollout(rollout);
        let current = status_for(rollout);
        let cancelled = is_cancelled(rollout);
        let pod_name = deployer_pod_name(rollout.name());
        let deployer = self.pod_lister.get(rollout.namespace(), &pod_name);

        let mut next = current;
        let mut updated = rollout.clone();
        // Reported after the status write so cleanup trouble never blocks it.
        let mut deferred: Option<ReconcileError> = None;

        match current {
            RolloutStatus::New if cancelled => {
                next = RolloutStatus::Pending;
                mark_cancelled_reason(&mut updated);
                if let Err(e) = self.cleanup_deployer_pods(rollout).await {
                    deferred = Some(e);
                }
            }
            RolloutStatus::New => match deployer {
                Some(pod) => next = self.adopt_or_reject(&mut updated, &pod).await,
                None => {
                    let pod = self.make_deployer_pod(rollout)?;
                    match self.pods.create(&pod).await {
                        Ok(created) => {
                            info!(rollout = %label, pod = %created.name(), "created deployer pod");
                            set_annotation(&mut updated.metadata, DEPLOYER_POD_ANNOTATION, created.name());
                            next = RolloutStatus::Pending;
                        }
                        Err(e) if e.is_already_exists() => {
                            let existing = self.pods.get(rollout.namespace(), &pod_name).await?;
                            next = self.adopt_or_reject(&mut updated, &existing).await;
                        }
                        Err(e) => {
                            emit(
                                self.recorder.as_ref(),
                                rollout,
                                EventType::Warning,
                                "FailedCreate",
                                format!("Error creating deployer pod: {e}"),
                            )
                            .await;
                            return Err(ReconcileError::actionable(format!(
                                "couldn't create deployer pod for {label}: {e}"
                            )));
                        }
                    }
                }
            },
            RolloutStatus::Pending | RolloutStatus::Running => match deployer {
                None if cancelled => {
                    next = RolloutStatus::Failed;
                    mark_cancelled_reason(&mut updated);
                }
                None if !is_cache_stale => {
                    return Err(ReconcileError::transient(format!(
                        "deployer pod {pod_name} for {label} not found in cache yet"
                    )));
                }
                None => {
                    next = RolloutStatus::Failed;
                    set_annotation(
                        &mut updated.metadata,
                        STATUS_REASON_ANNOTATION,
                        REASON_DEPLOYER_POD_NO_LONGER_EXISTS,
                    );
                    emit(
                        self.recorder.as_ref(),
                        rollout,
                        EventType::Warning,
                        "Failed",
                        format!("Deployer pod {pod_name:?} has gone missing"),
                    )
                    .await;
                }
                Some(pod) if cancelled => {
                    if phase_status(&pod) == RolloutStatus::Complete {
                        next = RolloutStatus::Complete;
                        remove_annotation(&mut updated.metadata, CANCELLED_ANNOTATION);
                        remove_annotation(&mut updated.metadata, STATUS_REASON_ANNOTATION);
                        emit(
                            self.recorder.as_ref(),
                            rollout,
                            EventType::Warning,
                            "FailedCancellation",
                            "Succeeded before cancel recorded",
                        )
                        .await;
                    } else {
                        self.cleanup_deployer_pods(rollout).await?;
                    }
                }
                Some(pod) => next = advance(current, phase_status(&pod)),
            },
            RolloutStatus::Complete | RolloutStatus::Failed => {
                if let Err(e) = self.cleanup_deployer_pods(rollout).await {
                    deferred = Some(e);
                }
            }
        }

        let transition = current.can_transition_to(next);
        let mut write = transition || updated.metadata != rollout.metadata;
        if transition {
            set_annotation(&mut updated.metadata, STATUS_ANNOTATION, next.as_str());
        }
        if next.is_terminal() && replicas_for(&updated) != 0 && self.is_test(rollout) {
            set_replicas(&mut updated, 0);
            write = true;
        }

        if write {
            self.rollouts.update(&updated).await.map_err(|e| {
                ReconcileError::transient(format!(
                    "couldn't update rollout {label} to status {next}: {e}"
                ))
            })?;
            if transition {
                info!(rollout = %label, from = %current, to = %next, "updated rollout status");
            }
            if transition && cancelled && next == RolloutStatus::Failed {
                emit(
                    self.recorder.as_ref(),
                    rollout,
                    EventType::Normal,
                    "RolloutCancelled",
                    "Rollout for the config cancelled",
                )
                .await;
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Status after finding an existing worker pod with the expected name.
    async fn adopt_or_reject(&self, updated: &mut Rollout, pod: &Pod) -> RolloutStatus {
        if pod.annotation(DEPLOYMENT_ANNOTATION) == Some(updated.name()) {
            set_annotation(&mut updated.metadata, DEPLOYER_POD_ANNOTATION, pod.name());
            return advance(RolloutStatus::Pending, phase_status(pod));
        }

        set_annotation(
            &mut updated.metadata,
            STATUS_REASON_ANNOTATION,
            REASON_UNRELATED_DEPLOYMENT_EXISTS,
        );
        emit(
            self.recorder.as_ref(),
            &*updated,
            EventType::Warning,
            "FailedCreate",
            format!(
                "Error creating deployer pod since another pod with the same name ({}) exists",
                pod.name()
            ),
        )
        .await;
        RolloutStatus::Failed
    }

    /// Deletes the worker pod and every hook pod of `rollout`.
    async fn cleanup_deployer_pods(&self, rollout: &Rollout) -> Result<(), ReconcileError> {
        let pods = self
            .pod_lister
            .list(Some(rollout.namespace()), &deployer_pod_selector(rollout.name()));

        let mut failed = Vec::new();
        for pod in &pods {
            match self.pods.delete(pod.namespace(), pod.name()).await {
                Ok(()) => debug!(rollout = %rollout.key(), pod = %pod.name(), "deleted deployer pod"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(rollout = %rollout.key(), pod = %pod.name(), error = %e, "couldn't delete deployer pod");
                    failed.push(pod.name().to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::actionable(format!(
                "couldn't clean up deployer pods {} for {}",
                failed.join(", "),
                label_for_rollout(rollout)
            )))
        }
    }

    fn is_test(&self, rollout: &Rollout) -> bool {
        decode_config(rollout, self.codec.as_ref())
            .map(|config| config.spec.test)
            .unwrap_or(false)
    }

    fn make_deployer_pod(&self, rollout: &Rollout) -> Result<Pod, ReconcileError> {
        let config = decode_config(rollout, self.codec.as_ref()).map_err(|e| {
            ReconcileError::fatal(format!(
                "couldn't make deployer pod for {}: {e}",
                label_for_rollout(rollout)
            ))
        })?;
        let strategy = &config.spec.strategy;
        let template = rollout
            .spec
            .as_ref()
            .and_then(|spec| spec.template.as_ref())
            .and_then(|template| template.spec.as_ref());

        let mut labels = strategy.labels.clone();
        labels.insert(
            DEPLOYER_POD_FOR_DEPLOYMENT_LABEL.to_string(),
            rollout.name().to_string(),
        );

        let mut annotations = BTreeMap::from([(CONFIG_ANNOTATION.to_string(), config.name().to_string())]);
        annotations.extend(strategy.annotations.clone());
        annotations.insert(DEPLOYMENT_ANNOTATION.to_string(), rollout.name().to_string());

        let owner = rollout.meta().uid.clone().map(|uid| OwnerReference {
            api_version: "v1".to_string(),
            kind: Rollout::KIND.to_string(),
            name: rollout.name().to_string(),
            uid,
            controller: Some(true),
            block_owner_deletion: None,
        });

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(deployer_pod_name(rollout.name())),
                namespace: Some(rollout.namespace().to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: owner.map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![self.make_deployer_container(&config.spec.strategy, rollout)],
                active_deadline_seconds: Some(
                    strategy
                        .active_deadline_seconds
                        .unwrap_or(MAX_DEPLOYMENT_DURATION_SECONDS),
                ),
                dns_policy: template.and_then(|spec| spec.dns_policy.clone()),
                image_pull_secrets: template.and_then(|spec| spec.image_pull_secrets.clone()),
                node_selector: template.and_then(|spec| spec.node_selector.clone()),
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(self.settings.service_account.clone())
                    .filter(|account| !account.is_empty()),
                termination_grace_period_seconds: Some(10),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn make_deployer_container(
        &self,
        strategy: &DeploymentStrategy,
        rollout: &Rollout,
    ) -> Container {
        let mut image = self.settings.image.clone();
        let mut command = None;
        let mut env = Vec::new();
        let mut seen = HashSet::new();

        if let Some(custom) = &strategy.custom_params {
            if !custom.image.is_empty() {
                image = custom.image.clone();
            }
            if !custom.command.is_empty() {
                command = Some(custom.command.clone());
            }
            for var in &custom.environment {
                seen.insert(var.name.clone());
                env.push(var.clone());
            }
        }
        for var in &self.settings.environment {
            if seen.insert(var.name.clone()) {
                env.push(var.clone());
            }
        }
        env.push(env_var("KROLLOUT_DEPLOYMENT_NAME", rollout.name()));
        env.push(env_var("KROLLOUT_DEPLOYMENT_NAMESPACE", rollout.namespace()));

        Container {
            name: DEPLOYER_CONTAINER_NAME.to_string(),
            image: Some(image),
            command,
            env: Some(env),
            resources: strategy.resources.clone(),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ..Default::default()
        }
    }

    async fn handle_err(&self, result: Result<(), ReconcileError>, key: &ObjectKey, rollout: Option<&Rollout>) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        match err {
            ReconcileError::Fatal(message) => {
                error!(rollout = %key, "{message}");
                self.queue.forget(key);
            }
            ReconcileError::Actionable(message) => {
                if let Some(rollout) = rollout {
                    emit(
                        self.recorder.as_ref(),
                        rollout,
                        EventType::Warning,
                        "FailedRetry",
                        message.clone(),
                    )
                    .await;
                }
                warn!(rollout = %key, "{message}");
                self.queue.forget(key);
            }
            err => {
                if self.queue.num_requeues(key) < self.settings.max_retries {
                    warn!(rollout = %key, error = %err, "retrying rollout");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(rollout = %key, error = %err, "dropping rollout out of the queue");
                    self.queue.forget(key);
                }
            }
        }
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Rollout status implied by a worker pod phase; unknown phases read as New.
fn phase_status(pod: &Pod) -> RolloutStatus {
    match pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
        Some("Pending") => RolloutStatus::Pending,
        Some("Running") => RolloutStatus::Running,
        Some("Succeeded") => RolloutStatus::Complete,
        Some("Failed") => RolloutStatus::Failed,
        _ => RolloutStatus::New,
    }
}

/// `observed` when it is ahead of `current`, otherwise `current`.
fn advance(current: RolloutStatus, observed: RolloutStatus) -> RolloutStatus {
    if current.can_transition_to(observed) {
        observed
    } else {
        current
    }
}

/// Records why a cancelled rollout stopped unless a cause is already known.
fn mark_cancelled_reason(rollout: &mut Rollout) {
    if rollout.annotation(STATUS_REASON_ANNOTATION) != Some(REASON_NEWER_DEPLOYMENT_EXISTS) {
        set_annotation(&mut rollout.metadata, STATUS_REASON_ANNOTATION, REASON_CANCELLED_BY_USER);
    }
}

struct RolloutEvents {
    queue: WorkQueue<ObjectKey>,
}

impl RolloutEvents {
    fn enqueue(&self, rollout: &Rollout) {
        if config_name_for(rollout).is_some() {
            self.queue.add(rollout.key());
        }
    }
}

impl EventHandler<Rollout> for RolloutEvents {
    fn on_add(&self, rollout: &Rollout) {
        self.enqueue(rollout);
    }

    fn on_update(&self, _old: &Rollout, new: &Rollout) {
        self.enqueue(new);
    }

    fn on_delete(&self, _rollout: &Rollout) {}
}

struct PodEvents {
    queue: WorkQueue<ObjectKey>,
    rollouts: Arc<dyn Lister<Rollout>>,
}

impl PodEvents {
    fn enqueue(&self, pod: &Pod) {
        let Some(name) = rollout_name_for_pod(pod) else {
            return;
        };
        if self.rollouts.get(pod.namespace(), name).is_some() {
            self.queue.add(ObjectKey::new(pod.namespace(), name));
        }
    }
}

impl EventHandler<Pod> for PodEvents {
    fn on_add(&self, pod: &Pod) {
        self.enqueue(pod);
    }

    fn on_update(&self, _old: &Pod, new: &Pod) {
        self.enqueue(new);
    }

    fn on_delete(&self, pod: &Pod) {
        self.enqueue(pod);
    }
}
