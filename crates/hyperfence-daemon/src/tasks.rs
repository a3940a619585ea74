//! In-process intent queue and task registry (spec §6).
//!
//! `spec.md` describes the core as exposing "a queue" to its REST/CLI
//! clients without naming a transport; the REST surface itself is out
//! of scope (§1 non-goals treat it as a client of this core). This
//! module is that queue's in-process shape: an `mpsc` channel of
//! [`Intent`] values drained by one worker loop, with a
//! [`TaskRegistry`] tracking each submitted intent's status the way an
//! operator would poll it.

use hyperfence_store::{StoreClient, Versioned};
use hyperfence_types::{DesiredState, NodeName, Task, TaskId, TaskKind, TaskStatus, Vm, VmId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// One operator-submitted action, as accepted by the task/worker queue.
#[derive(Debug, Clone)]
pub struct Intent {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub vm_id: VmId,
    /// Present for `vm-migrate`/`vm-move`: the requested destination.
    pub target_node: Option<NodeName>,
}

/// Tracks every submitted [`Task`] by id so a client can poll progress.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn insert(&self, task: Task) {
        self.tasks.lock().await.insert(task.id, task);
    }

    async fn update(&self, id: TaskId, f: impl FnOnce(&mut Task)) {
        if let Some(task) = self.tasks.lock().await.get_mut(&id) {
            f(task);
        }
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().await.get(&id).cloned()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits an intent, registering a `Pending` [`Task`] and returning its id.
pub async fn submit(
    registry: &TaskRegistry,
    sender: &mpsc::Sender<Intent>,
    kind: TaskKind,
    vm_id: VmId,
    target_node: Option<NodeName>,
) -> TaskId {
    let task_id = TaskId::new(Uuid::new_v4());
    registry.insert(Task::new(task_id, kind.clone(), vm_id.to_string())).await;
    let intent = Intent {
        task_id,
        kind,
        vm_id,
        target_node,
    };
    if sender.send(intent).await.is_err() {
        warn!(task = %task_id, "intent queue worker is gone, task will never progress");
    }
    task_id
}

async fn vm_path(store: &StoreClient, id: VmId) -> anyhow::Result<String> {
    Ok(store.resolve_path("domain", &id.to_string()).await?)
}

/// Drains submitted intents, translating each into a desired-state
/// write on the VM's shared record (spec §4.5: the instance controller
/// reconciles observed-state toward whatever desired-state is written
/// here).
pub async fn worker_loop(store: StoreClient, registry: TaskRegistry, mut receiver: mpsc::Receiver<Intent>) {
    while let Some(intent) = receiver.recv().await {
        registry
            .update(intent.task_id, |t| t.status = TaskStatus::Running)
            .await;

        match apply_intent(&store, &intent).await {
            Ok(()) => {
                info!(task = %intent.task_id, vm = %intent.vm_id, kind = ?intent.kind, "intent applied");
                registry.update(intent.task_id, |t| t.succeed()).await;
            }
            Err(err) => {
                warn!(task = %intent.task_id, vm = %intent.vm_id, error = %err, "intent failed");
                let reason = err.to_string();
                registry.update(intent.task_id, |t| t.fail(reason)).await;
            }
        }
    }
}

async fn apply_intent(store: &StoreClient, intent: &Intent) -> anyhow::Result<()> {
    let path = vm_path(store, intent.vm_id).await?;
    let versioned: Versioned<Vm> = store
        .get(&path)
        .await?
        .ok_or_else(|| anyhow::anyhow!("vm {} has no record", intent.vm_id))?;
    let mut vm = versioned.value;

    match intent.kind {
        TaskKind::VmStart | TaskKind::VmRecover => vm.desired_state = DesiredState::Start,
        TaskKind::VmStop => vm.desired_state = DesiredState::Stop,
        TaskKind::VmShutdown => vm.desired_state = DesiredState::Shutdown,
        TaskKind::VmRestart => vm.desired_state = DesiredState::Restart,
        TaskKind::VmUndefine => vm.desired_state = DesiredState::Disable,
        TaskKind::VmMigrate => {
            vm.desired_state = DesiredState::Migrate;
            vm.migration_target = intent.target_node.clone();
        }
        TaskKind::VmMove => {
            vm.desired_state = DesiredState::Move;
            vm.migration_target = intent.target_node.clone();
        }
        TaskKind::VmUnmigrate => {
            if vm.previous_node.is_none() {
                anyhow::bail!("vm {} has no previous node to unmigrate to", intent.vm_id);
            }
            vm.desired_state = DesiredState::Unmigrate;
        }
        TaskKind::VmDefine => {}
        TaskKind::NodeFlush | TaskKind::NodeReady | TaskKind::NodePrimary | TaskKind::NodeSecondary => {
            anyhow::bail!("{:?} is a node-scoped intent, not a vm-scoped one", intent.kind);
        }
    }

    store.cas(&path, Some(versioned.version), &vm).await?;
    Ok(())
}
