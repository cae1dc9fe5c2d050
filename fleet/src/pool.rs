use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use sandbox::ControlPlane;
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::instance::{ClaimedInstance, ID_PREFIX, Instance, LifecycleState};
use crate::task::{CompileTask, ExecutionResult, millis};

#[derive(Default)]
struct Members {
    instances: HashMap<String, Arc<Instance>>,
    closed: bool,
}

/// Warm pool of sandbox instances.
///
/// Every instance is tracked from the moment it starts provisioning until it
/// is destroyed, so [`shutdown`](Self::shutdown) can reach all of them. The
/// membership lock is never held across a control-plane call.
pub struct FleetPool {
    control_plane: Arc<dyn ControlPlane>,
    config: Arc<FleetConfig>,
    members: Arc<Mutex<Members>>,
}

impl FleetPool {
    /// Create the pool and bring `standby_target` instances to idle in parallel.
    ///
    /// Instances that fail to provision are destroyed and dropped. Fails only
    /// if a non-zero target was requested and none of them became idle.
    pub async fn initialize(
        control_plane: Arc<dyn ControlPlane>,
        config: FleetConfig,
    ) -> FleetResult<Self> {
        config.validate()?;
        let target = config.standby_target;
        info!(
            control_plane = control_plane.name(),
            image = %config.image,
            standby = target,
            "initializing fleet"
        );

        let pool = Self {
            control_plane,
            config: Arc::new(config),
            members: Arc::new(Mutex::new(Members::default())),
        };
        if target == 0 {
            info!("fleet initialized without standby instances");
            return Ok(pool);
        }

        let started = Instant::now();
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..target {
            let instance = pool.track_new()?;
            join_set.spawn(async move {
                let result = instance.provision().await;
                (instance, result)
            });
        }

        let mut idle = 0usize;
        let mut last_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((instance, Ok(()))) => match instance.mark_idle() {
                    Ok(()) => idle += 1,
                    Err(e) => {
                        last_error = Some(e.to_string());
                        pool.discard(&instance).await;
                    }
                },
                Ok((instance, Err(e))) => {
                    warn!(id = %instance.id(), error = %e, "standby instance failed to provision");
                    last_error = Some(e.to_string());
                    pool.discard(&instance).await;
                }
                Err(e) => {
                    error!(error = %e, "provisioning task panicked");
                    last_error = Some(e.to_string());
                }
            }
        }

        if idle == 0 {
            if let Err(e) = pool.shutdown().await {
                warn!(error = %e, "cleanup after failed initialization was incomplete");
            }
            return Err(FleetError::FleetInitializationFailed {
                requested: target,
                reason: last_error.unwrap_or_else(|| "no instance provisioned".into()),
            });
        }
        if idle < target {
            warn!(
                requested = target,
                idle, "fleet initialized with fewer instances than requested"
            );
        }
        info!(
            idle,
            elapsed_ms = millis(started.elapsed()),
            "fleet initialized"
        );
        Ok(pool)
    }

    /// Run `task` on an idle instance, provisioning a new one if none is free.
    ///
    /// Failed instances are destroyed before the error is returned, as are
    /// instances that reached `max_uses`. If the returned future is dropped
    /// mid-run, the instance is destroyed in the background.
    pub async fn delegate(&self, task: CompileTask) -> FleetResult<ExecutionResult> {
        let claimed = match self.claim_idle(&task)? {
            Some(claimed) => claimed,
            None => self.claim_on_demand(&task).await?,
        };
        let instance = Arc::clone(claimed.instance());
        let guard = DiscardOnDrop::new(&self.members, &instance);
        info!(
            id = %instance.id(),
            language = %task.language.name,
            problem_kind = %task.problem_kind,
            "task dispatched"
        );

        let outcome = claimed.run().await;
        guard.disarm();
        match instance.state() {
            LifecycleState::Failed => self.discard(&instance).await,
            LifecycleState::Running => {
                info!(id = %instance.id(), uses = instance.uses(), "retiring instance");
                self.discard(&instance).await;
            }
            _ => {}
        }
        outcome
    }

    fn claim_idle(&self, task: &CompileTask) -> FleetResult<Option<ClaimedInstance>> {
        let members = self.lock_members();
        if members.closed {
            return Err(FleetError::ShuttingDown);
        }
        Ok(members
            .instances
            .values()
            .filter(|instance| instance.state() == LifecycleState::Idle)
            .find_map(|instance| instance.claim(task).ok()))
    }

    async fn claim_on_demand(&self, task: &CompileTask) -> FleetResult<ClaimedInstance> {
        let instance = self.track_new()?;
        info!(id = %instance.id(), "no idle instance, provisioning on demand");

        let guard = DiscardOnDrop::new(&self.members, &instance);
        let provisioned = instance.provision().await;
        guard.disarm();
        if let Err(e) = provisioned {
            self.discard(&instance).await;
            return Err(e);
        }
        match instance.claim_provisioned(task) {
            Ok(claimed) => Ok(claimed),
            Err(_) if self.is_closed() => Err(FleetError::ShuttingDown),
            Err(e) => {
                self.discard(&instance).await;
                Err(e)
            }
        }
    }

    fn track_new(&self) -> FleetResult<Arc<Instance>> {
        let mut members = self.lock_members();
        if members.closed {
            return Err(FleetError::ShuttingDown);
        }
        let instance = Instance::new(Arc::clone(&self.control_plane), Arc::clone(&self.config));
        members
            .instances
            .insert(instance.id().to_owned(), Arc::clone(&instance));
        Ok(instance)
    }

    async fn discard(&self, instance: &Instance) {
        discard_from(&self.members, instance).await;
    }

    /// Destroy every tracked instance in parallel and close the control plane.
    ///
    /// Waits for in-flight runs and provisioning to finish first. Later
    /// delegates fail with [`FleetError::ShuttingDown`].
    pub async fn shutdown(&self) -> FleetResult<()> {
        let instances: Vec<Arc<Instance>> = {
            let mut members = self.lock_members();
            members.closed = true;
            members.instances.drain().map(|(_, instance)| instance).collect()
        };
        info!(count = instances.len(), "shutting down fleet");

        let ids: Vec<String> = instances.iter().map(|i| i.id().to_owned()).collect();
        let mut join_set = tokio::task::JoinSet::new();
        for instance in instances {
            join_set.spawn(async move {
                let result = instance.destroy().await;
                (instance, result)
            });
        }

        let mut destroyed = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((instance, Ok(()))) => {
                    destroyed.insert(instance.id().to_owned());
                }
                Ok((instance, Err(e))) => {
                    error!(id = %instance.id(), error = %e, "instance teardown failed");
                }
                Err(e) => error!(error = %e, "teardown task panicked"),
            }
        }
        self.control_plane.close().await;

        let mut failed: Vec<String> = ids
            .into_iter()
            .filter(|id| !destroyed.contains(id))
            .collect();
        if failed.is_empty() {
            info!(destroyed = destroyed.len(), "fleet shut down");
            return Ok(());
        }
        failed.sort();
        Err(FleetError::PartialTeardownFailure { failed })
    }

    /// Instances the daemon reports under this pool's naming scheme that the
    /// pool does not track, such as leftovers from a previous process.
    pub async fn untracked_instances(&self) -> FleetResult<Vec<String>> {
        let listed = self.control_plane.list_instances().await?;
        let members = self.lock_members();
        let mut untracked: Vec<String> = listed
            .into_iter()
            .filter(|name| name.starts_with(ID_PREFIX))
            .filter(|name| !members.instances.contains_key(name))
            .collect();
        untracked.sort();
        Ok(untracked)
    }

    /// Tracked instances, whatever their state.
    pub fn len(&self) -> usize {
        self.lock_members().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.lock_members()
            .instances
            .values()
            .filter(|instance| instance.state() == LifecycleState::Idle)
            .count()
    }

    /// Snapshot of `(id, state)` for every tracked instance, sorted by id.
    pub fn states(&self) -> Vec<(String, LifecycleState)> {
        let mut states: Vec<_> = self
            .lock_members()
            .instances
            .values()
            .map(|instance| (instance.id().to_owned(), instance.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn is_closed(&self) -> bool {
        self.lock_members().closed
    }

    fn lock_members(&self) -> MutexGuard<'_, Members> {
        lock(&self.members)
    }
}

fn lock(members: &Mutex<Members>) -> MutexGuard<'_, Members> {
    members.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Destroy and forget `instance`. On failure it stays tracked so shutdown
/// retries and reports it.
async fn discard_from(members: &Mutex<Members>, instance: &Instance) {
    match instance.destroy().await {
        Ok(()) => {
            lock(members).instances.remove(instance.id());
        }
        Err(e) => warn!(id = %instance.id(), error = %e, "instance left for shutdown"),
    }
}

/// Destroys an instance in the background if the future driving it is
/// dropped before [`disarm`](Self::disarm).
struct DiscardOnDrop {
    members: Arc<Mutex<Members>>,
    instance: Option<Arc<Instance>>,
}

impl DiscardOnDrop {
    fn new(members: &Arc<Mutex<Members>>, instance: &Arc<Instance>) -> Self {
        Self {
            members: Arc::clone(members),
            instance: Some(Arc::clone(instance)),
        }
    }

    fn disarm(mut self) {
        self.instance = None;
    }
}

impl Drop for DiscardOnDrop {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(id = %instance.id(), "no runtime to destroy abandoned instance");
            return;
        };
        info!(id = %instance.id(), "task abandoned, destroying instance");
        let members = Arc::clone(&self.members);
        runtime.spawn(async move {
            discard_from(&members, &instance).await;
        });
    }
}

impl Drop for FleetPool {
    fn drop(&mut self) {
        let members = self.lock_members();
        if !members.closed && !members.instances.is_empty() {
            warn!(
                instances = members.instances.len(),
                "FleetPool dropped without calling shutdown()"
            );
        }
    }
}
