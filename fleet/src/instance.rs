use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sandbox::{ControlPlane, ExecRequest, InstanceStatus, SandboxError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::task::{CompileTask, ExecutionResult, Measurements, millis};

/// Slack on top of the exec timeout before the instance gives up on the
/// control plane itself.
const EXEC_GRACE: Duration = Duration::from_secs(1);

pub(crate) const ID_PREFIX: &str = "fv";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Provisioning = 0,
    Running = 1,
    Idle = 2,
    Busy = 3,
    Stopping = 4,
    Destroyed = 5,
    Failed = 6,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 6, "invalid LifecycleState: {v}");
        match v {
            0 => Self::Provisioning,
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Busy,
            4 => Self::Stopping,
            5 => Self::Destroyed,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Running => f.write_str("running"),
            Self::Idle => f.write_str("idle"),
            Self::Busy => f.write_str("busy"),
            Self::Stopping => f.write_str("stopping"),
            Self::Destroyed => f.write_str("destroyed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// One container owned by the fleet.
///
/// State changes go through CAS on `state`. Provision, run and destroy also
/// hold `lifecycle`, so they never overlap on the same instance; a claim only
/// succeeds if it can take that lock without waiting and keeps it until the
/// run finishes.
pub struct Instance {
    id: String,
    control_plane: Arc<dyn ControlPlane>,
    config: Arc<FleetConfig>,
    state: AtomicU8,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    /// Set exactly while the state is `Busy`.
    task: Mutex<Option<CompileTask>>,
    uses: AtomicU32,
}

impl Instance {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: Arc<FleetConfig>) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{ID_PREFIX}{}", uuid::Uuid::new_v4().simple()),
            control_plane,
            config,
            state: AtomicU8::new(LifecycleState::Provisioning as u8),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            task: Mutex::new(None),
            uses: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Task currently assigned, present only while `Busy`.
    pub fn assigned_task(&self) -> Option<CompileTask> {
        self.task_slot().clone()
    }

    /// Successful runs completed on this instance.
    pub fn uses(&self) -> u32 {
        self.uses.load(Ordering::Acquire)
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<CompileTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self, action: &'static str) -> FleetError {
        SandboxError::InvalidStateTransition {
            id: self.id.clone(),
            action,
            state: self.state().to_string(),
        }
        .into()
    }

    /// Create the container and wait until the daemon reports it running.
    ///
    /// Bounded by `provision_timeout`; any failure leaves the instance `Failed`.
    pub async fn provision(&self) -> FleetResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != LifecycleState::Provisioning {
            return Err(self.invalid("provision"));
        }

        let started = Instant::now();
        let budget = self.config.provision_timeout();
        let outcome = match tokio::time::timeout(budget, self.boot()).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::ProvisioningTimeout {
                id: self.id.clone(),
                waited_ms: self.config.provision_timeout_ms,
            }),
        };

        match outcome {
            Ok(()) if self.transition(LifecycleState::Provisioning, LifecycleState::Running) => {
                info!(
                    id = %self.id,
                    elapsed_ms = millis(started.elapsed()),
                    "instance running"
                );
                Ok(())
            }
            Ok(()) => Err(self.invalid("provision")),
            Err(e) => {
                self.set_state(LifecycleState::Failed);
                warn!(id = %self.id, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    async fn boot(&self) -> FleetResult<()> {
        let handle = self
            .control_plane
            .create_instance(&self.id, &self.config.image)
            .await?;
        debug!(
            id = %self.id,
            image = %self.config.image,
            pending = handle.is_pending(),
            "instance created"
        );

        let interval = self.config.poll_interval();
        loop {
            match self.control_plane.get_state(&self.id).await {
                Ok(InstanceStatus::Running) => return Ok(()),
                Ok(InstanceStatus::Stopped) => match self.control_plane.start(&self.id).await {
                    Ok(()) => debug!(id = %self.id, "start requested"),
                    Err(e @ SandboxError::DaemonUnavailable(_)) => return Err(e.into()),
                    Err(e) => debug!(id = %self.id, error = %e, "start not accepted yet"),
                },
                Ok(status) => trace!(id = %self.id, %status, "waiting for instance"),
                Err(e @ SandboxError::DaemonUnavailable(_)) => return Err(e.into()),
                Err(e) => debug!(id = %self.id, error = %e, "state query failed, retrying"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Move a freshly provisioned instance into the idle set.
    pub fn mark_idle(&self) -> FleetResult<()> {
        if self.transition(LifecycleState::Running, LifecycleState::Idle) {
            Ok(())
        } else {
            Err(self.invalid("mark idle"))
        }
    }

    /// Reserve an idle instance for `task`.
    ///
    /// Never waits: if another caller holds the instance, or it is not idle,
    /// this fails with [`FleetError::AlreadyBusy`].
    pub fn claim(self: &Arc<Self>, task: &CompileTask) -> FleetResult<ClaimedInstance> {
        self.claim_from(LifecycleState::Idle, task)
    }

    /// Claim an instance this caller just provisioned, before it is ever idle.
    pub(crate) fn claim_provisioned(
        self: &Arc<Self>,
        task: &CompileTask,
    ) -> FleetResult<ClaimedInstance> {
        self.claim_from(LifecycleState::Running, task)
    }

    fn claim_from(
        self: &Arc<Self>,
        from: LifecycleState,
        task: &CompileTask,
    ) -> FleetResult<ClaimedInstance> {
        let busy = || FleetError::AlreadyBusy {
            id: self.id.clone(),
            state: self.state(),
        };
        let Ok(lifecycle) = Arc::clone(&self.lifecycle).try_lock_owned() else {
            return Err(busy());
        };
        let mut slot = self.task_slot();
        if !self.transition(from, LifecycleState::Busy) {
            return Err(busy());
        }
        *slot = Some(task.clone());
        drop(slot);

        debug!(id = %self.id, problem_kind = %task.problem_kind, "instance claimed");
        Ok(ClaimedInstance {
            instance: Arc::clone(self),
            claimed_at: Instant::now(),
            completed: false,
            _lifecycle: lifecycle,
        })
    }

    fn release(&self, next: LifecycleState) {
        let mut slot = self.task_slot();
        *slot = None;
        self.set_state(next);
    }

    async fn execute(
        &self,
        task: &CompileTask,
        claimed_at: Instant,
    ) -> FleetResult<ExecutionResult> {
        let path = task.language.source_path(&self.config.source_dir);
        self.control_plane
            .push_file(&self.id, &path, task.code.content.as_bytes())
            .await?;

        let cmd = task.language.command_for(&path);
        let request = ExecRequest {
            cmd: &cmd,
            timeout_ms: self.config.exec_timeout_ms,
        };
        let exec_started = Instant::now();
        let bound = self.config.exec_timeout() + EXEC_GRACE;
        let exec = self.control_plane.exec(&self.id, &request);
        let result = match tokio::time::timeout(bound, exec).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SandboxError::ExecutionTimeout {
                    id: self.id.clone(),
                    timeout_ms: self.config.exec_timeout_ms,
                }
                .into());
            }
        };
        let execution = exec_started.elapsed();

        if result.exit_code != 0 {
            let output = if result.stderr.is_empty() {
                result.stdout
            } else {
                result.stderr
            };
            return Err(FleetError::ExecutionFailed {
                id: self.id.clone(),
                exit_code: result.exit_code,
                output,
            });
        }

        if self.config.remove_source_after_run
            && let Err(e) = self.control_plane.remove_file(&self.id, &path).await
        {
            warn!(id = %self.id, path = %path, error = %e, "failed to remove source file");
        }

        Ok(ExecutionResult::new(
            &self.id,
            &task.language,
            result.stdout,
            result.exit_code,
            Measurements {
                spin_up: exec_started.duration_since(claimed_at),
                execution,
                cpu_time_ms: result.cpu_time_ms,
                memory_bytes: result.memory_bytes,
            },
        ))
    }

    /// Stop and delete the container. Idempotent once `Destroyed`.
    ///
    /// Waits for any in-flight provision or run on this instance first.
    pub async fn destroy(&self) -> FleetResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == LifecycleState::Destroyed {
            return Ok(());
        }
        self.set_state(LifecycleState::Stopping);

        match self.teardown().await {
            Ok(()) => {
                self.release(LifecycleState::Destroyed);
                info!(id = %self.id, "instance destroyed");
                Ok(())
            }
            Err(e) => {
                self.release(LifecycleState::Failed);
                Err(FleetError::TeardownError {
                    id: self.id.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn teardown(&self) -> sandbox::Result<()> {
        match self.control_plane.get_state(&self.id).await? {
            InstanceStatus::NotFound => return Ok(()),
            InstanceStatus::Running => self.control_plane.stop(&self.id).await?,
            _ => {}
        }
        self.control_plane.delete(&self.id).await
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("uses", &self.uses())
            .finish()
    }
}

/// Exclusive hold on a `Busy` instance.
///
/// Dropping it before [`run`](Self::run) completes, including when the run
/// future itself is cancelled, leaves the instance `Failed` so its owner
/// destroys it.
#[derive(Debug)]
pub struct ClaimedInstance {
    instance: Arc<Instance>,
    claimed_at: Instant,
    completed: bool,
    _lifecycle: OwnedMutexGuard<()>,
}

impl ClaimedInstance {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Push the source, execute it, and release the instance.
    ///
    /// On success the instance returns to `Idle`, or stays `Running` once it
    /// has reached `max_uses` so the owner can retire it. Any error leaves it
    /// `Failed`.
    pub async fn run(mut self) -> FleetResult<ExecutionResult> {
        let instance = &self.instance;
        let Some(task) = instance.assigned_task() else {
            return Err(instance.invalid("run"));
        };

        let outcome = instance.execute(&task, self.claimed_at).await;
        match &outcome {
            Ok(result) => {
                let uses = instance.uses.fetch_add(1, Ordering::AcqRel).saturating_add(1);
                let exhausted = instance.config.max_uses.is_some_and(|max| uses >= max);
                instance.release(if exhausted {
                    LifecycleState::Running
                } else {
                    LifecycleState::Idle
                });
                info!(
                    id = %instance.id,
                    language = %task.language.name,
                    problem_kind = %task.problem_kind,
                    total_ms = result.total_time_ms(),
                    spin_up_ms = result.spin_up_time_ms(),
                    exec_ms = result.execution_time_ms(),
                    cpu_ms = result.cpu_time_ms(),
                    memory_bytes = result.memory_bytes(),
                    exhausted,
                    "task completed"
                );
            }
            Err(e) => {
                instance.release(LifecycleState::Failed);
                warn!(
                    id = %instance.id,
                    language = %task.language.name,
                    problem_kind = %task.problem_kind,
                    error = %e,
                    "task failed"
                );
            }
        }
        self.completed = true;
        outcome
    }
}

impl Drop for ClaimedInstance {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // The remote exec may still be running; only a destroy reclaims it.
        self.instance.release(LifecycleState::Failed);
        warn!(id = %self.instance.id, "claim dropped before the task completed");
    }
}
