//! End-to-end lifecycle tests — enqueue → schedule → start → run → terminate
//! against a recording fake agent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use berth_core::agent::{AgentClient, KernelCreationSpec};
use berth_core::events::{
    ChannelEventProducer, ClusterEvent, KernelEventKind, KernelLifecycleEvent,
};
use berth_core::fair_share::InMemoryUsageRecordStore;
use berth_core::hooks::NoopDeploymentRepository;
use berth_core::manager::{KernelSpec, Manager, ManagerArgs, ManagerDaemon, SessionCreator};
use berth_core::registry::TerminationDisposition;
use berth_core::resource::{ResourceSlot, SlotTypeCatalog};
use berth_core::scheduler::InMemoryStateStore;
use berth_core::state::{
    AgentRecord, AgentStatus, ClusterMode, ClusterRole, KernelStatus, SessionResult,
    SessionStatus, SessionType,
};
use berth_core::types::{AccessKey, AgentId, Config, EndpointId, Error, Result, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentCall {
    CreateKernels { session_id: SessionId, kernel_count: usize },
    DestroyKernel { kernel_id: String, reason: String },
    TriggerBatch { startup_command: String, batch_timeout: Option<Duration> },
}

/// Fake agent client that records calls and can fail destroys on demand.
#[derive(Debug, Default)]
struct RecordingAgentClient {
    calls: StdMutex<Vec<AgentCall>>,
    destroy_failures_remaining: AtomicUsize,
}

impl RecordingAgentClient {
    fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_next_destroys(&self, count: usize) {
        self.destroy_failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentClient for RecordingAgentClient {
    async fn create_kernels(
        &self,
        session_id: &SessionId,
        specs: &[KernelCreationSpec],
    ) -> Result<()> {
        self.calls.lock().unwrap().push(AgentCall::CreateKernels {
            session_id: session_id.clone(),
            kernel_count: specs.len(),
        });
        Ok(())
    }

    async fn destroy_kernel(
        &self,
        kernel_id: &berth_core::types::KernelId,
        _session_id: &SessionId,
        reason: &str,
        _suppress_events: bool,
    ) -> Result<()> {
        if self
            .destroy_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::rpc("injected destroy failure"));
        }
        self.calls.lock().unwrap().push(AgentCall::DestroyKernel {
            kernel_id: kernel_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn trigger_batch_execution(
        &self,
        _session_id: &SessionId,
        _kernel_id: &berth_core::types::KernelId,
        startup_command: &str,
        batch_timeout: Option<Duration>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(AgentCall::TriggerBatch {
            startup_command: startup_command.to_string(),
            batch_timeout,
        });
        Ok(())
    }
}

struct Harness {
    manager: Arc<Manager>,
    agent_client: Arc<RecordingAgentClient>,
    usage_store: Arc<InMemoryUsageRecordStore>,
    events_rx: tokio::sync::mpsc::UnboundedReceiver<ClusterEvent>,
}

fn slots(pairs: &[(&str, &str)]) -> ResourceSlot {
    ResourceSlot::from_pairs(pairs.iter().copied()).unwrap()
}

async fn harness_with_config(config: Config) -> Harness {
    let (events, events_rx) = ChannelEventProducer::channel();
    let usage_store = Arc::new(InMemoryUsageRecordStore::new());
    let manager = Arc::new(Manager::new(ManagerArgs {
        config,
        catalog: SlotTypeCatalog::with_defaults(),
        deployments: Arc::new(NoopDeploymentRepository),
        events,
        state_store: Arc::new(InMemoryStateStore::new()),
        usage_store: usage_store.clone(),
    }));

    let agent_client = Arc::new(RecordingAgentClient::default());
    let agent_id = AgentId::from("i-001");
    manager
        .upsert_agent(AgentRecord {
            id: agent_id.clone(),
            scaling_group: "sg01".into(),
            addr: "10.0.1.1:6001".into(),
            architecture: "x86_64".into(),
            status: AgentStatus::Alive,
            schedulable: true,
            available_slots: slots(&[("cpu", "4"), ("mem", "4096")]),
            lost_at: None,
        })
        .await
        .unwrap();
    manager
        .agent_pool()
        .register(agent_id, agent_client.clone())
        .await;

    Harness {
        manager,
        agent_client,
        usage_store,
        events_rx,
    }
}

async fn harness() -> Harness {
    harness_with_config(Config::default()).await
}

fn creator(session_type: SessionType, requested: &[(&str, &str)]) -> SessionCreator {
    SessionCreator {
        access_key: AccessKey::from("user01"),
        domain: "default".into(),
        project: "default".into(),
        user: "user01".into(),
        name: "test-session".into(),
        session_type,
        cluster_mode: ClusterMode::SingleNode,
        cluster_size: 1,
        scaling_group: "sg01".into(),
        architecture: "x86_64".into(),
        priority: None,
        depends_on: Default::default(),
        startup_command: None,
        batch_timeout: None,
        bootstrap_script: None,
        environ: BTreeMap::new(),
        callback_url: None,
        endpoint_id: None,
        kernels: vec![KernelSpec {
            image: "python:3.12".into(),
            architecture: None,
            cluster_role: ClusterRole::Main,
            cluster_idx: 0,
            requested_slots: slots(requested),
            startup_command: None,
        }],
    }
}

/// Drive every kernel of a session through one lifecycle event.
async fn push_kernel_events(manager: &Manager, session_id: &SessionId, kind: KernelEventKind) {
    let entry = manager
        .sessions()
        .session_with_kernels(session_id)
        .await
        .unwrap();
    for kernel in &entry.kernels {
        manager
            .handle_kernel_event(&KernelLifecycleEvent::new(kernel.id.clone(), kind))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn interactive_session_full_lifecycle() {
    let hx = harness().await;
    let agent_id = AgentId::from("i-001");

    let session_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "2"), ("mem", "1024")],
        ))
        .await
        .unwrap();

    // Scheduling tick: PENDING -> SCHEDULED with ledger deduction.
    let stats = hx.manager.scheduler_tick().await.unwrap();
    assert_eq!(stats.scheduled, 1);
    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Scheduled);
    assert!(session.occupying_slots.is_zero());
    let used = hx
        .manager
        .ledger()
        .get_agent_occupancy(std::slice::from_ref(&agent_id))
        .await;
    assert_eq!(used[&agent_id], slots(&[("cpu", "2"), ("mem", "1024")]));

    // Lifecycle tick ships create_kernels; kernels go PREPARING.
    let stats = hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(stats.kernels_preparing, 1);
    assert!(matches!(
        hx.agent_client.calls().first(),
        Some(AgentCall::CreateKernels { kernel_count: 1, .. })
    ));
    let entry = hx
        .manager
        .sessions()
        .session_with_kernels(&session_id)
        .await
        .unwrap();
    assert_eq!(entry.session.status, SessionStatus::Preparing);
    assert_eq!(entry.kernels[0].status, KernelStatus::Preparing);

    // Agent reports the kernel running: occupying slots become real.
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;
    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(
        session.occupying_slots,
        slots(&[("cpu", "2"), ("mem", "1024")])
    );

    // Terminate: request returns immediately, destroy goes out on the tick,
    // the agent event closes the session and frees the ledger.
    let disposition = hx
        .manager
        .terminate_session(&session_id, "user-requested")
        .await
        .unwrap();
    assert_eq!(disposition, TerminationDisposition::Terminating);
    let stats = hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(stats.termination.destroyed, 1);
    assert!(hx
        .agent_client
        .calls()
        .iter()
        .any(|c| matches!(c, AgentCall::DestroyKernel { reason, .. } if reason == "user-requested")));
    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Terminating);

    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Terminated).await;
    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
    assert!(session.occupying_slots.is_zero());
    assert!(session.terminated_at.is_some());
    assert_eq!(session.result, SessionResult::Success);
    let used = hx
        .manager
        .ledger()
        .get_agent_occupancy(std::slice::from_ref(&agent_id))
        .await;
    assert!(used[&agent_id].is_zero());

    // Re-terminating a finished session is a no-op.
    assert_eq!(
        hx.manager
            .terminate_session(&session_id, "again")
            .await
            .unwrap(),
        TerminationDisposition::AlreadyTerminal
    );
}

#[tokio::test]
async fn batch_session_triggers_startup_command_on_running() {
    let hx = harness().await;
    let mut creator = creator(SessionType::Batch, &[("cpu", "1"), ("mem", "512")]);
    creator.startup_command = Some("python train.py".into());
    creator.batch_timeout = Some(Duration::from_secs(3600));
    let session_id = hx.manager.enqueue_session(creator).await.unwrap();

    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;

    let calls = hx.agent_client.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        AgentCall::TriggerBatch { startup_command, batch_timeout }
            if startup_command == "python train.py"
                && *batch_timeout == Some(Duration::from_secs(3600))
    )));
}

#[tokio::test]
async fn batch_exit_code_decides_session_result() {
    let hx = harness().await;
    let session_id = hx
        .manager
        .enqueue_session(creator(SessionType::Batch, &[("cpu", "1"), ("mem", "512")]))
        .await
        .unwrap();
    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;

    let entry = hx
        .manager
        .sessions()
        .session_with_kernels(&session_id)
        .await
        .unwrap();
    let mut event =
        KernelLifecycleEvent::new(entry.kernels[0].id.clone(), KernelEventKind::Terminated);
    event.exit_code = Some(2);
    hx.manager.handle_kernel_event(&event).await.unwrap();

    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
    assert_eq!(session.result, SessionResult::Failure);
}

#[tokio::test]
async fn inference_session_publishes_route_updates() {
    let mut hx = harness().await;
    let endpoint_id = EndpointId::new();
    let mut creator = creator(SessionType::Inference, &[("cpu", "1"), ("mem", "512")]);
    creator.endpoint_id = Some(endpoint_id.clone());
    let session_id = hx.manager.enqueue_session(creator).await.unwrap();

    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;
    assert_eq!(
        hx.events_rx.recv().await,
        Some(ClusterEvent::EndpointRouteListUpdated(endpoint_id.clone()))
    );

    hx.manager
        .terminate_session(&session_id, "scale-down")
        .await
        .unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Terminated).await;
    assert_eq!(
        hx.events_rx.recv().await,
        Some(ClusterEvent::EndpointRouteListUpdated(endpoint_id))
    );
}

#[tokio::test]
async fn failed_destroy_keeps_session_terminating_until_retry_succeeds() {
    let hx = harness().await;
    let session_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "1"), ("mem", "512")],
        ))
        .await
        .unwrap();
    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;

    hx.agent_client.fail_next_destroys(1);
    hx.manager
        .terminate_session(&session_id, "user-requested")
        .await
        .unwrap();

    let stats = hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(stats.termination.failed, 1);
    assert_eq!(stats.termination.destroyed, 0);
    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Terminating);

    // Next tick retries and succeeds.
    let stats = hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(stats.termination.destroyed, 1);
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Terminated).await;
    assert_eq!(
        hx.manager
            .sessions()
            .session(&session_id)
            .await
            .unwrap()
            .status,
        SessionStatus::Terminated
    );
}

#[tokio::test]
async fn lost_agent_sweep_force_terminates_kernels() {
    let mut config = Config::default();
    config.lifecycle.lost_agent_grace = Duration::ZERO;
    let hx = harness_with_config(config).await;
    let agent_id = AgentId::from("i-001");

    let session_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "2"), ("mem", "1024")],
        ))
        .await
        .unwrap();
    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;

    hx.manager.mark_agent_lost(&agent_id).await.unwrap();
    let stats = hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(stats.sweep.kernels_terminated, 1);
    assert_eq!(stats.sweep.sessions_closed, 1);

    let session = hx.manager.sessions().session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
    let used = hx
        .manager
        .ledger()
        .get_agent_occupancy(std::slice::from_ref(&agent_id))
        .await;
    assert!(used[&agent_id].is_zero());

    // The agent coming back does not resurrect the session.
    hx.manager.mark_agent_alive(&agent_id).await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    assert_eq!(
        hx.manager
            .sessions()
            .session(&session_id)
            .await
            .unwrap()
            .status,
        SessionStatus::Terminated
    );
}

#[tokio::test]
async fn fair_share_tick_persists_contiguous_slices() {
    let hx = harness().await;
    let session_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "2"), ("mem", "1024")],
        ))
        .await
        .unwrap();
    hx.manager.scheduler_tick().await.unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &session_id, KernelEventKind::Started).await;

    // Pretend three boundaries have passed since the kernel started.
    let now = Utc::now() + chrono::Duration::seconds(3 * 300);
    let persisted = hx.manager.fair_share_tick(now).await.unwrap();
    assert!(persisted >= 1);

    let slices = hx.usage_store.snapshot().await;
    assert_eq!(slices.len(), persisted);
    for pair in slices.windows(2) {
        assert_eq!(pair[0].period_end, pair[1].period_start);
    }
    // Resource-seconds scale with occupancy.
    let cpu: Decimal = slices
        .iter()
        .map(|s| s.resource_usage.get(&"cpu".parse().unwrap()))
        .sum();
    assert!(cpu > Decimal::ZERO);

    // A second tick at the same instant adds nothing.
    let again = hx.manager.fair_share_tick(now).await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn daemon_drives_the_ticks_in_the_background() {
    let mut config = Config::default();
    config.scheduler.tick_interval = Duration::from_millis(10);
    config.lifecycle.tick_interval = Duration::from_millis(10);
    config.fair_share.tick_interval = Duration::from_millis(10);
    let hx = harness_with_config(config).await;

    let session_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "1"), ("mem", "512")],
        ))
        .await
        .unwrap();

    let mut daemon = ManagerDaemon::new(hx.manager.clone());
    daemon.start();

    // The background scheduler and lifecycle ticks pick the session up and
    // ship its kernel without any manual tick calls.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status = hx.manager.sessions().session(&session_id).await.unwrap().status;
        if status == SessionStatus::Preparing {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session stuck in {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn enqueue_validation_rejects_malformed_creators() {
    let hx = harness().await;

    let mut no_kernels = creator(SessionType::Interactive, &[("cpu", "1")]);
    no_kernels.kernels.clear();
    no_kernels.cluster_size = 0;
    assert!(matches!(
        hx.manager.enqueue_session(no_kernels).await,
        Err(Error::Validation(_))
    ));

    let mut bad_size = creator(SessionType::Interactive, &[("cpu", "1")]);
    bad_size.cluster_size = 3;
    assert!(matches!(
        hx.manager.enqueue_session(bad_size).await,
        Err(Error::Validation(_))
    ));

    let mut unknown_slot = creator(SessionType::Interactive, &[("cpu", "1")]);
    unknown_slot.kernels[0].requested_slots =
        ResourceSlot::from_pairs([("warp.cores", "1")]).unwrap();
    assert!(matches!(
        hx.manager.enqueue_session(unknown_slot).await,
        Err(Error::SlotTypeNotFound(_))
    ));

    let mut missing_dep = creator(SessionType::Interactive, &[("cpu", "1")]);
    missing_dep.depends_on.insert(SessionId::new());
    assert!(matches!(
        hx.manager.enqueue_session(missing_dep).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn dependent_session_waits_then_schedules_after_success() {
    let hx = harness().await;
    let dep_id = hx
        .manager
        .enqueue_session(creator(
            SessionType::Interactive,
            &[("cpu", "1"), ("mem", "512")],
        ))
        .await
        .unwrap();

    let mut dependent = creator(SessionType::Interactive, &[("cpu", "1"), ("mem", "512")]);
    dependent.depends_on.insert(dep_id.clone());
    let dependent_id = hx.manager.enqueue_session(dependent).await.unwrap();

    // First tick: the dependency itself schedules, the dependent waits.
    hx.manager.scheduler_tick().await.unwrap();
    let waiting = hx.manager.sessions().session(&dependent_id).await.unwrap();
    assert_eq!(waiting.status, SessionStatus::Pending);
    assert!(waiting
        .status_info
        .as_deref()
        .unwrap()
        .starts_with("dependency-not-met"));

    // Drive the dependency to successful termination.
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &dep_id, KernelEventKind::Started).await;
    hx.manager
        .terminate_session(&dep_id, "finished")
        .await
        .unwrap();
    hx.manager.lifecycle_tick().await.unwrap();
    push_kernel_events(&hx.manager, &dep_id, KernelEventKind::Terminated).await;

    // Now the dependent is admissible.
    let stats = hx.manager.scheduler_tick().await.unwrap();
    assert_eq!(stats.scheduled, 1);
    assert_eq!(
        hx.manager
            .sessions()
            .session(&dependent_id)
            .await
            .unwrap()
            .status,
        SessionStatus::Scheduled
    );
}
