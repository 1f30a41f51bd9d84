//! Session registry and event router
//!
//! A single task owns the registry. It reads the connection's event stream,
//! starts a session for every new parked call, forwards events to the
//! session they belong to and resolves background jobs by `Job-UUID`.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    connection::{ConnectionStatus, DisconnectReason, EslConnection, EslEventStream},
    constants::{
        DEFAULT_APP_GRACE_PERIOD, DEFAULT_HANDLER_DRAIN_TIMEOUT, DEFAULT_JOB_TIMEOUT,
        DEFAULT_SESSION_QUEUE_SIZE, SESSION_EVENTS,
    },
    dispatcher::{Dispatcher, SessionEnd},
    error::{EslError, EslResult},
    event::{EslEvent, EslEventType, EventFormat},
    host::AppHost,
    session::Session,
};

/// Tuning for the router and the sessions it starts.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Capacity of each session's inbound queue. Default: 64.
    pub session_queue_size: usize,
    /// Deadline used by `Session::exec_bg_api`; `None` waits forever.
    /// Default: 30s.
    pub job_timeout: Option<Duration>,
    /// How long an application may outlive its call before it is aborted.
    /// Default: 5s.
    pub app_grace_period: Duration,
    /// How long event handlers may outlive their dispatcher. Default: 2s.
    pub handler_drain_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            session_queue_size: DEFAULT_SESSION_QUEUE_SIZE,
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
            app_grace_period: DEFAULT_APP_GRACE_PERIOD,
            handler_drain_timeout: DEFAULT_HANDLER_DRAIN_TIMEOUT,
        }
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Live sessions.
    pub sessions: usize,
    /// Background jobs waiting for their result.
    pub jobs: usize,
    /// Events dropped because a session queue was full.
    pub dropped_events: u64,
}

pub(crate) type JobSlot = oneshot::Sender<EslResult<EslEvent>>;

enum RouterControl {
    RegisterJob {
        job_id: String,
        owner: Option<String>,
        slot: JobSlot,
    },
    CancelJob {
        job_id: String,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
}

/// Router-side view of one live session.
pub(crate) struct SessionHandle {
    events: mpsc::Sender<EslEvent>,
    terminal: Option<oneshot::Sender<SessionEnd>>,
}

impl SessionHandle {
    pub(crate) fn new(
        events: mpsc::Sender<EslEvent>,
        terminal: oneshot::Sender<SessionEnd>,
    ) -> Self {
        Self {
            events,
            terminal: Some(terminal),
        }
    }

    fn end(&mut self, end: SessionEnd) {
        if let Some(terminal) = self
            .terminal
            .take()
        {
            let _ = terminal.send(end);
        }
    }
}

struct PendingJob {
    owner: Option<String>,
    slot: JobSlot,
}

/// Call-id and job-id tables. Only the router task touches them.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<String, SessionHandle>,
    jobs: HashMap<String, PendingJob>,
    dropped_events: u64,
}

impl SessionRegistry {
    pub(crate) fn contains(&self, uuid: &str) -> bool {
        self.sessions
            .contains_key(uuid)
    }

    pub(crate) fn insert(&mut self, uuid: String, handle: SessionHandle) {
        self.sessions
            .insert(uuid, handle);
    }

    /// Queue an event for its session without blocking.
    ///
    /// Returns `false` when the call-id is not registered.
    pub(crate) fn forward(&mut self, uuid: &str, event: EslEvent) -> bool {
        let Some(handle) = self
            .sessions
            .get_mut(uuid)
        else {
            return false;
        };
        match handle
            .events
            .try_send(event)
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped_events += 1;
                warn!(
                    "[ROUTER] session {} queue full, dropping {} event",
                    uuid,
                    event
                        .event_name()
                        .unwrap_or("unknown")
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("[ROUTER] session {} dispatcher already gone", uuid);
            }
        }
        true
    }

    /// Deliver `CHANNEL_DESTROY` and forget the call.
    ///
    /// A destroy that does not fit in the queue is handed over through the
    /// terminal slot instead, so the session always learns about it. Jobs
    /// owned by the call fail with `ChannelClosed`.
    pub(crate) fn destroy(&mut self, uuid: &str, event: EslEvent) {
        let Some(mut handle) = self
            .sessions
            .remove(uuid)
        else {
            trace!("[ROUTER] destroy for unknown call {}", uuid);
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = handle
            .events
            .try_send(event)
        {
            debug!("[ROUTER] session {} queue full, closing through terminal slot", uuid);
            handle.end(SessionEnd::Destroyed(event));
        }

        let owned: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.owner.as_deref() == Some(uuid))
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in owned {
            if let Some(job) = self
                .jobs
                .remove(&job_id)
            {
                let _ = job
                    .slot
                    .send(Err(EslError::channel_closed(uuid)));
            }
        }
        debug!("[ROUTER] session {} removed", uuid);
    }

    pub(crate) fn register_job(&mut self, job_id: String, owner: Option<String>, slot: JobSlot) {
        self.jobs
            .insert(job_id, PendingJob { owner, slot });
    }

    pub(crate) fn cancel_job(&mut self, job_id: &str) {
        if self
            .jobs
            .remove(job_id)
            .is_some()
        {
            debug!("[ROUTER] job {} abandoned", job_id);
        }
    }

    /// Hand a `BACKGROUND_JOB` result to its waiter.
    ///
    /// Returns `false` for unknown or already resolved job ids.
    pub(crate) fn resolve_job(&mut self, job_id: &str, event: EslEvent) -> bool {
        match self
            .jobs
            .remove(job_id)
        {
            Some(job) => {
                let _ = job
                    .slot
                    .send(Ok(event));
                true
            }
            None => false,
        }
    }

    /// Fail every session and every job with a connection error.
    pub(crate) fn fail_all(&mut self, error: &EslError) {
        for (_, mut handle) in self
            .sessions
            .drain()
        {
            handle.end(SessionEnd::Failed(error.duplicate()));
        }
        for (_, job) in self
            .jobs
            .drain()
        {
            let _ = job
                .slot
                .send(Err(error.duplicate()));
        }
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self
                .sessions
                .len(),
            jobs: self
                .jobs
                .len(),
            dropped_events: self.dropped_events,
        }
    }
}

/// Cloneable handle for talking to a running [`EslRouter`].
#[derive(Clone)]
pub struct RouterHandle {
    control: mpsc::UnboundedSender<RouterControl>,
    connection: EslConnection,
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("running", &!self.control.is_closed())
            .finish()
    }
}

impl RouterHandle {
    fn router_gone(&self) -> EslError {
        match self
            .connection
            .status()
        {
            ConnectionStatus::Disconnected(reason) => EslError::Disconnected(reason),
            _ => EslError::Disconnected(DisconnectReason::ConnectionClosed),
        }
    }

    /// Run a connection-level background job not tied to any call.
    pub async fn bgapi(&self, command: &str, timeout: Option<Duration>) -> EslResult<EslEvent> {
        self.submit_job(None, command, timeout)
            .await
    }

    /// Current registry counters.
    pub async fn stats(&self) -> EslResult<RegistryStats> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(RouterControl::Stats { reply })
            .map_err(|_| self.router_gone())?;
        rx.await
            .map_err(|_| self.router_gone())
    }

    /// Register a job, issue `bgapi`, wait for its `BACKGROUND_JOB` result.
    pub(crate) async fn submit_job(
        &self,
        owner: Option<&str>,
        command: &str,
        timeout: Option<Duration>,
    ) -> EslResult<EslEvent> {
        let job_id = Uuid::new_v4().to_string();
        let (slot, rx) = oneshot::channel();

        // Registered before the write: the router drains control messages
        // ahead of events, so the result can never beat the registration.
        self.control
            .send(RouterControl::RegisterJob {
                job_id: job_id.clone(),
                owner: owner.map(str::to_string),
                slot,
            })
            .map_err(|_| self.router_gone())?;

        if let Err(e) = self
            .connection
            .submit_background_job(command, &job_id)
            .await
        {
            self.cancel_job(&job_id);
            return Err(e);
        }
        debug!("[JOB] {} submitted: {}", job_id, command);

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("[JOB] {} timed out after {}ms", job_id, limit.as_millis());
                    self.cancel_job(&job_id);
                    return Err(EslError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(self.router_gone()))
    }

    fn cancel_job(&self, job_id: &str) {
        let _ = self
            .control
            .send(RouterControl::CancelJob {
                job_id: job_id.to_string(),
            });
    }
}

/// Owns the event stream and the registry; run it on its own task.
pub struct EslRouter {
    connection: EslConnection,
    events: EslEventStream,
    host: AppHost,
    options: RouterOptions,
    registry: SessionRegistry,
    control_rx: mpsc::UnboundedReceiver<RouterControl>,
    handle: RouterHandle,
}

impl EslRouter {
    /// Build a router over a connection and its event stream.
    pub fn new(
        connection: EslConnection,
        events: EslEventStream,
        host: AppHost,
        options: RouterOptions,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let handle = RouterHandle {
            control,
            connection: connection.clone(),
        };
        Self {
            connection,
            events,
            host,
            options,
            registry: SessionRegistry::default(),
            control_rx,
            handle,
        }
    }

    /// Handle for job submission and stats; valid while the router runs.
    pub fn handle(&self) -> RouterHandle {
        self.handle
            .clone()
    }

    /// Subscribe to every event the router needs.
    pub async fn subscribe(&self, format: EventFormat) -> EslResult<()> {
        self.connection
            .subscribe_events(format, SESSION_EVENTS)
            .await
    }

    /// Route events until the connection fails.
    ///
    /// Every session and pending job is failed with the connection error,
    /// which is then returned. There is no retry.
    pub async fn run(mut self) -> EslResult<()> {
        info!("[ROUTER] started");
        loop {
            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => self.on_control(control),
                next = self.events.read_next_event() => match next {
                    Ok(event) => self.on_event(event),
                    Err(e) => {
                        warn!("[ROUTER] connection failed: {}", e);
                        let stats = self.registry.stats();
                        self.registry.fail_all(&e);
                        info!(
                            "[ROUTER] stopped, failed {} sessions and {} jobs",
                            stats.sessions, stats.jobs
                        );
                        return Err(e);
                    }
                },
            }
        }
    }

    fn on_control(&mut self, control: RouterControl) {
        match control {
            RouterControl::RegisterJob {
                job_id,
                owner,
                slot,
            } => self
                .registry
                .register_job(job_id, owner, slot),
            RouterControl::CancelJob { job_id } => self
                .registry
                .cancel_job(&job_id),
            RouterControl::Stats { reply } => {
                let _ = reply.send(
                    self.registry
                        .stats(),
                );
            }
        }
    }

    fn on_event(&mut self, event: EslEvent) {
        match event.event_type() {
            Some(EslEventType::Heartbeat) => {
                trace!("[ROUTER] heartbeat");
                return;
            }
            Some(EslEventType::BackgroundJob) => {
                match event
                    .job_uuid()
                    .map(str::to_string)
                {
                    Some(job_id) => {
                        if !self
                            .registry
                            .resolve_job(&job_id, event)
                        {
                            debug!("[ROUTER] result for unknown job {}", job_id);
                        }
                    }
                    None => warn!("[ROUTER] BACKGROUND_JOB without Job-UUID"),
                }
                return;
            }
            _ => {}
        }

        let Some(uuid) = event
            .unique_id()
            .map(str::to_string)
        else {
            trace!("[ROUTER] ignoring {:?} without Unique-ID", event.event_name());
            return;
        };

        if event.is_event_type(EslEventType::ChannelDestroy) {
            self.registry
                .destroy(&uuid, event);
        } else if self
            .registry
            .contains(&uuid)
        {
            self.registry
                .forward(&uuid, event);
        } else if event.is_event_type(EslEventType::ChannelPark) {
            self.start_session(uuid, event);
        } else {
            trace!("[ROUTER] no session for {}", uuid);
        }
    }

    fn start_session(&mut self, uuid: String, park: EslEvent) {
        let (events_tx, events_rx) = mpsc::channel(
            self.options
                .session_queue_size
                .max(1),
        );
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let session = Session::new(
            uuid.clone(),
            park,
            self.connection
                .clone(),
            self.handle
                .clone(),
            control_tx,
            closed.clone(),
            self.options
                .job_timeout,
        );

        if !self
            .host
            .start(session, &self.options)
        {
            debug!("[ROUTER] no application accepted call {}", uuid);
            return;
        }

        self.registry
            .insert(uuid.clone(), SessionHandle::new(events_tx, terminal_tx));
        let dispatcher = Dispatcher::new(
            uuid.clone(),
            events_rx,
            control_rx,
            terminal_rx,
            closed,
            self.options
                .handler_drain_timeout,
        );
        tokio::spawn(dispatcher.run());
        info!("[ROUTER] session {} started", uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, uuid: &str) -> EslEvent {
        let mut event = EslEvent::new();
        event.set_header("Event-Name", name);
        event.set_header("Unique-ID", uuid);
        event
    }

    fn session(
        registry: &mut SessionRegistry,
        uuid: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<EslEvent>, oneshot::Receiver<SessionEnd>) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (terminal_tx, terminal_rx) = oneshot::channel();
        registry.insert(uuid.to_string(), SessionHandle::new(events_tx, terminal_tx));
        (events_rx, terminal_rx)
    }

    #[test]
    fn test_forward_never_blocks_on_full_queue() {
        let mut registry = SessionRegistry::default();
        let (mut rx, _terminal) = session(&mut registry, "A-1", 1);

        assert!(registry.forward("A-1", event("CHANNEL_EXECUTE", "A-1")));
        assert!(registry.forward("A-1", event("CHANNEL_ANSWER", "A-1")));
        assert!(!registry.forward("B-2", event("CHANNEL_ANSWER", "B-2")));

        assert_eq!(registry.stats().dropped_events, 1);
        assert_eq!(
            rx.try_recv()
                .unwrap()
                .event_name(),
            Some("CHANNEL_EXECUTE")
        );
        assert!(rx
            .try_recv()
            .is_err());
    }

    #[test]
    fn test_destroy_with_full_queue_uses_terminal_slot() {
        let mut registry = SessionRegistry::default();
        let (_rx, mut terminal) = session(&mut registry, "A-1", 1);

        registry.forward("A-1", event("CHANNEL_HANGUP", "A-1"));
        registry.destroy("A-1", event("CHANNEL_DESTROY", "A-1"));

        assert!(!registry.contains("A-1"));
        match terminal.try_recv() {
            Ok(SessionEnd::Destroyed(destroy)) => {
                assert_eq!(destroy.event_name(), Some("CHANNEL_DESTROY"))
            }
            _ => panic!("destroy must reach the session"),
        }
    }

    #[test]
    fn test_destroy_fails_owned_jobs_only() {
        let mut registry = SessionRegistry::default();
        let (_rx, _terminal) = session(&mut registry, "A-1", 4);

        let (owned_tx, mut owned_rx) = oneshot::channel();
        let (global_tx, mut global_rx) = oneshot::channel();
        registry.register_job("J-1".into(), Some("A-1".into()), owned_tx);
        registry.register_job("J-2".into(), None, global_tx);

        registry.destroy("A-1", event("CHANNEL_DESTROY", "A-1"));

        assert!(matches!(
            owned_rx.try_recv(),
            Ok(Err(EslError::ChannelClosed { .. }))
        ));
        assert!(global_rx
            .try_recv()
            .is_err());
        assert_eq!(registry.stats().jobs, 1);
    }

    #[test]
    fn test_job_resolved_once() {
        let mut registry = SessionRegistry::default();
        let (tx, mut rx) = oneshot::channel();
        registry.register_job("J-1".into(), None, tx);

        let mut result = EslEvent::with_type(EslEventType::BackgroundJob);
        result.set_header("Job-UUID", "J-1");
        assert!(registry.resolve_job("J-1", result.clone()));
        assert!(!registry.resolve_job("J-1", result));

        let delivered = rx
            .try_recv()
            .unwrap()
            .unwrap();
        assert_eq!(delivered.job_uuid(), Some("J-1"));
        assert_eq!(registry.stats().jobs, 0);
    }

    #[test]
    fn test_cancelled_job_ignores_late_result() {
        let mut registry = SessionRegistry::default();
        let (tx, _rx) = oneshot::channel();
        registry.register_job("J-1".into(), None, tx);
        registry.cancel_job("J-1");

        assert!(!registry.resolve_job("J-1", EslEvent::new()));
    }

    #[test]
    fn test_fail_all_reaches_sessions_and_jobs() {
        let mut registry = SessionRegistry::default();
        let (_rx1, mut t1) = session(&mut registry, "A-1", 4);
        let (_rx2, mut t2) = session(&mut registry, "B-2", 4);
        let (tx, mut job) = oneshot::channel();
        registry.register_job("J-1".into(), Some("A-1".into()), tx);

        let error = EslError::Disconnected(DisconnectReason::ConnectionClosed);
        registry.fail_all(&error);

        for terminal in [&mut t1, &mut t2] {
            assert!(matches!(
                terminal.try_recv(),
                Ok(SessionEnd::Failed(EslError::Disconnected(_)))
            ));
        }
        assert!(matches!(
            job.try_recv(),
            Ok(Err(EslError::Disconnected(_)))
        ));
        assert_eq!(registry.stats(), RegistryStats::default());
    }
}
