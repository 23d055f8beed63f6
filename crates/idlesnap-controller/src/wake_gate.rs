//! Request gate in front of suspended instances
//!
//! Requests for a suspended instance join a single-flight restore group
//! keyed by `(instance, epoch, generation)`. One driver task performs the
//! restore and then replays the group in arrival order; on failure every
//! member gets the same error. Callers await a per-request promise instead of
//! a wake callback.

use crate::controller::{InstanceStatus, SnapshotController};
use async_trait::async_trait;
use idlesnap_common::{
    BackpressureReason, InboundRequest, InstanceId, InstanceResponse, InstanceState, Result,
    SnapshotError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delivers a request to a running instance.
#[async_trait]
pub trait InstanceTransport: Send + Sync {
    async fn forward(&self, request: InboundRequest) -> Result<InstanceResponse>;
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Buffered requests per restore group
    pub max_queue_depth: usize,
    /// Upper bound on a caller's total wait
    pub request_timeout: Duration,
}

impl GateConfig {
    pub fn from_controller(controller: &SnapshotController) -> Self {
        let config = controller.config();
        Self {
            max_queue_depth: config.max_queue_depth,
            request_timeout: config.request_timeout(),
        }
    }
}

struct Pending {
    request: InboundRequest,
    reply: oneshot::Sender<Result<InstanceResponse>>,
}

/// One restore group per suspension: a later checkpoint of the same instance
/// gets a fresh group even while an older one is still draining.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    instance: InstanceId,
    epoch: u32,
    generation: u64,
}

impl GroupKey {
    fn new(instance: &InstanceId, status: InstanceStatus) -> Self {
        Self {
            instance: instance.clone(),
            epoch: status.epoch,
            generation: status.generation,
        }
    }
}

struct RestoreGroup {
    enqueued_at: Instant,
    pending: VecDeque<Pending>,
}

type Groups = Mutex<HashMap<GroupKey, RestoreGroup>>;

pub struct WakeGate {
    controller: Arc<SnapshotController>,
    transport: Arc<dyn InstanceTransport>,
    config: GateConfig,
    groups: Arc<Groups>,
}

enum Admission {
    Queued(oneshot::Receiver<Result<InstanceResponse>>),
    Forward,
    AwaitCheckpoint,
}

impl WakeGate {
    pub fn new(
        controller: Arc<SnapshotController>,
        transport: Arc<dyn InstanceTransport>,
        config: GateConfig,
    ) -> Self {
        Self {
            controller,
            transport,
            config,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of requests currently buffered for an instance.
    pub async fn buffered(&self, instance: &InstanceId) -> usize {
        self.groups
            .lock()
            .await
            .iter()
            .filter(|(key, _)| &key.instance == instance)
            .map(|(_, group)| group.pending.len())
            .sum()
    }

    /// Route a request, waking the instance first if it is suspended.
    pub async fn route(&self, request: InboundRequest) -> Result<InstanceResponse> {
        let started = Instant::now();
        let deadline = started + self.config.request_timeout;
        let id = request.instance_id.clone();
        let mut request = Some(request);

        loop {
            let admission = {
                let mut groups = self.groups.lock().await;
                // Read under the groups lock so a wake finishing concurrently
                // is seen together with its group
                let status = self
                    .controller
                    .status(&id)
                    .ok_or_else(|| SnapshotError::UnknownInstance(id.clone()))?;
                let key = GroupKey::new(&id, status);

                if let Some(group) = groups.get_mut(&key) {
                    // A draining group keeps arrival order even once Running
                    Admission::Queued(self.enqueue(&id, group, &mut request)?)
                } else if status.state.is_terminal() {
                    return Err(SnapshotError::InstanceFailed(id.clone()));
                } else if status.state.needs_wake() {
                    let mut group = RestoreGroup {
                        enqueued_at: Instant::now(),
                        pending: VecDeque::new(),
                    };
                    let reply = self.enqueue(&id, &mut group, &mut request)?;
                    groups.insert(key.clone(), group);
                    self.spawn_driver(key);
                    Admission::Queued(reply)
                } else if status.state.is_in_flight() {
                    Admission::AwaitCheckpoint
                } else {
                    Admission::Forward
                }
            };

            match admission {
                Admission::Queued(reply) => return self.await_reply(&id, reply, started, deadline).await,
                Admission::Forward => {
                    let request = request.take().ok_or_else(|| {
                        SnapshotError::Internal("request consumed twice".into())
                    })?;
                    let response = self.transport.forward(request).await?;
                    self.controller.record_activity(&id).await?;
                    return Ok(response);
                }
                Admission::AwaitCheckpoint => {
                    self.await_checkpoint(&id, started, deadline).await?;
                }
            }
        }
    }

    fn enqueue(
        &self,
        id: &InstanceId,
        group: &mut RestoreGroup,
        request: &mut Option<InboundRequest>,
    ) -> Result<oneshot::Receiver<Result<InstanceResponse>>> {
        if group.pending.len() >= self.config.max_queue_depth {
            warn!(
                instance = %id,
                operation = "route",
                error_kind = "backpressure",
                "Restore queue full ({} buffered)",
                group.pending.len()
            );
            return Err(SnapshotError::Backpressure {
                instance: id.clone(),
                reason: BackpressureReason::QueueFull {
                    depth: group.pending.len(),
                },
            });
        }

        let request = request
            .take()
            .ok_or_else(|| SnapshotError::Internal("request consumed twice".into()))?;
        let (reply, rx) = oneshot::channel();
        group.pending.push_back(Pending { request, reply });
        Ok(rx)
    }

    async fn await_reply(
        &self,
        id: &InstanceId,
        reply: oneshot::Receiver<Result<InstanceResponse>>,
        started: Instant,
        deadline: Instant,
    ) -> Result<InstanceResponse> {
        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SnapshotError::Internal(format!(
                "restore driver for {id} dropped a buffered request"
            ))),
            Err(_) => Err(self.timed_out(id, started)),
        }
    }

    /// Wait for an in-flight checkpoint to resolve either way.
    async fn await_checkpoint(&self, id: &InstanceId, started: Instant, deadline: Instant) -> Result<()> {
        let Some(mut statuses) = self.controller.subscribe(id) else {
            return Err(SnapshotError::UnknownInstance(id.clone()));
        };
        let settled = statuses.wait_for(|status| status.state != InstanceState::Checkpointing);
        let outcome = match tokio::time::timeout_at(deadline, settled).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SnapshotError::UnknownInstance(id.clone())),
            Err(_) => Err(self.timed_out(id, started)),
        };
        outcome
    }

    fn timed_out(&self, id: &InstanceId, started: Instant) -> SnapshotError {
        let waited = started.elapsed();
        warn!(
            instance = %id,
            operation = "route",
            error_kind = "backpressure",
            "Request timed out after {:?}",
            waited
        );
        SnapshotError::Backpressure {
            instance: id.clone(),
            reason: BackpressureReason::Timeout { waited },
        }
    }

    fn spawn_driver(&self, key: GroupKey) {
        let controller = self.controller.clone();
        let transport = self.transport.clone();
        let groups = self.groups.clone();

        tokio::spawn(async move {
            debug!(
                instance = %key.instance,
                epoch = key.epoch,
                generation = key.generation,
                "Starting restore for buffered requests"
            );
            match wake(&controller, &key.instance).await {
                Ok(()) => drain(&controller, transport.as_ref(), &groups, &key).await,
                Err(err) => fail_group(&groups, &key, err).await,
            }
        });
    }
}

/// Restore the instance, or wait for someone else's restore to settle.
async fn wake(controller: &SnapshotController, id: &InstanceId) -> Result<()> {
    match controller.restore(id).await {
        Ok(_) => Ok(()),
        Err(SnapshotError::InvalidTransition {
            from: InstanceState::Restoring,
            ..
        }) => {
            let mut statuses = controller
                .subscribe(id)
                .ok_or_else(|| SnapshotError::UnknownInstance(id.clone()))?;
            let settled = statuses
                .wait_for(|status| status.state != InstanceState::Restoring)
                .await
                .map(|status| status.state)
                .map_err(|_| SnapshotError::UnknownInstance(id.clone()))?;
            match settled {
                InstanceState::Running => Ok(()),
                state if state.is_terminal() => Err(SnapshotError::InstanceFailed(id.clone())),
                other => Err(SnapshotError::InvalidTransition {
                    instance: id.clone(),
                    from: InstanceState::Restoring,
                    to: other,
                }),
            }
        }
        Err(err) => Err(err),
    }
}

/// Replay buffered requests in arrival order, then dissolve the group.
async fn drain(
    controller: &SnapshotController,
    transport: &dyn InstanceTransport,
    groups: &Groups,
    key: &GroupKey,
) {
    let id = &key.instance;
    let mut delivered = 0usize;
    let mut waited = Duration::ZERO;

    loop {
        let next = {
            let mut guard = groups.lock().await;
            let Some(group) = guard.get_mut(key) else {
                break;
            };
            waited = group.enqueued_at.elapsed();
            match group.pending.pop_front() {
                Some(pending) => pending,
                None => {
                    guard.remove(key);
                    break;
                }
            }
        };

        // The caller already gave up
        if next.reply.is_closed() {
            continue;
        }

        let outcome = transport.forward(next.request).await;
        if outcome.is_ok() {
            if let Err(err) = controller.record_activity(id).await {
                debug!(instance = %id, "Activity not recorded: {}", err);
            }
        }
        if next.reply.send(outcome).is_ok() {
            delivered += 1;
        }
    }

    info!(
        instance = %id,
        generation = key.generation,
        delivered,
        group_age_ms = waited.as_millis() as u64,
        "Replayed buffered requests"
    );
}

async fn fail_group(groups: &Groups, key: &GroupKey, err: SnapshotError) {
    let group = groups.lock().await.remove(key);
    let Some(group) = group else {
        return;
    };

    warn!(
        instance = %key.instance,
        operation = "restore",
        error_kind = err.kind(),
        generation = key.generation,
        "Failing {} buffered requests: {}",
        group.pending.len(),
        err
    );
    for pending in group.pending {
        let _ = pending.reply.send(Err(err.clone()));
    }
}
