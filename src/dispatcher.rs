//! Per-session dispatcher
//!
//! Reconciles the outstanding foreground command of one call with the
//! events the router forwards for it, and fans events out to handlers.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{EslError, EslResult},
    event::{EslEvent, EslEventType},
};

/// Callback run on its own task for every event with a matching name.
pub type EventHandler = Arc<dyn Fn(EslEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// How the router ends a session out of band.
pub(crate) enum SessionEnd {
    /// `CHANNEL_DESTROY` that did not fit in the session queue.
    Destroyed(EslEvent),
    /// The connection failed.
    Failed(EslError),
}

pub(crate) type CompletionSlot = oneshot::Sender<EslResult<EslEvent>>;

/// Requests from the session facade.
pub(crate) enum DispatcherControl {
    /// Wait for the `CHANNEL_EXECUTE_COMPLETE` whose `Application-UUID`
    /// matches. Replaces any earlier armed command.
    Arm {
        app_uuid: String,
        slot: CompletionSlot,
    },
    AddHandler {
        name: String,
        handler: EventHandler,
    },
    RemoveHandler {
        name: String,
    },
}

struct Armed {
    app_uuid: String,
    slot: CompletionSlot,
}

pub(crate) struct Dispatcher {
    uuid: String,
    events: mpsc::Receiver<EslEvent>,
    control: mpsc::UnboundedReceiver<DispatcherControl>,
    terminal: oneshot::Receiver<SessionEnd>,
    closed: CancellationToken,
    drain_timeout: Duration,
    armed: Option<Armed>,
    handlers: HashMap<String, EventHandler>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        uuid: String,
        events: mpsc::Receiver<EslEvent>,
        control: mpsc::UnboundedReceiver<DispatcherControl>,
        terminal: oneshot::Receiver<SessionEnd>,
        closed: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            uuid,
            events,
            control,
            terminal,
            closed,
            drain_timeout,
            armed: None,
            handlers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let reason = self
            .dispatch()
            .await;
        debug!("[SESSION] {} dispatcher ending: {}", self.uuid, reason);

        self.closed
            .cancel();
        if let Some(armed) = self
            .armed
            .take()
        {
            let _ = armed
                .slot
                .send(Err(reason));
        }
        // Commands armed after closure must not wait on a slot nobody fills.
        self.control
            .close();
        while let Ok(control) = self
            .control
            .try_recv()
        {
            if let DispatcherControl::Arm { slot, .. } = control {
                let _ = slot.send(Err(EslError::channel_closed(&self.uuid)));
            }
        }

        self.drain_handlers()
            .await;
    }

    async fn dispatch(&mut self) -> EslError {
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;
                control = self.control.recv(), if control_open => match control {
                    Some(control) => self.on_control(control),
                    None => control_open = false,
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_event(event) {
                            return reason;
                        }
                    }
                    // The router fills the terminal slot before dropping the queue.
                    None => {
                        let end = self.terminal.try_recv().ok();
                        return self.on_end(end);
                    }
                },
                end = &mut self.terminal => return self.on_end(end.ok()),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("[SESSION] {} event handler failed: {}", self.uuid, e);
                    }
                }
            }
        }
    }

    fn on_end(&mut self, end: Option<SessionEnd>) -> EslError {
        match end {
            Some(SessionEnd::Destroyed(event)) => {
                self.run_handler(&event);
                EslError::channel_closed(&self.uuid)
            }
            Some(SessionEnd::Failed(error)) => error,
            None => EslError::channel_closed(&self.uuid),
        }
    }

    fn on_control(&mut self, control: DispatcherControl) {
        match control {
            DispatcherControl::Arm { app_uuid, slot } => {
                trace!("[SESSION] {} waiting for {}", self.uuid, app_uuid);
                self.armed = Some(Armed { app_uuid, slot });
            }
            DispatcherControl::AddHandler { name, handler } => {
                self.handlers
                    .insert(name, handler);
            }
            DispatcherControl::RemoveHandler { name } => {
                self.handlers
                    .remove(&name);
            }
        }
    }

    /// Returns the closing reason when the event ends the session.
    fn on_event(&mut self, event: EslEvent) -> Option<EslError> {
        trace!("[SESSION] {} got {:?}", self.uuid, event.event_name());

        if event.is_event_type(EslEventType::ChannelExecuteComplete) {
            let completes_armed = self
                .armed
                .as_ref()
                .is_some_and(|armed| event.application_uuid() == Some(armed.app_uuid.as_str()));
            if completes_armed {
                if let Some(armed) = self
                    .armed
                    .take()
                {
                    self.run_handler(&event);
                    let _ = armed
                        .slot
                        .send(Ok(event));
                    return None;
                }
            }
            debug!(
                "[SESSION] {} discarding stale completion {:?}",
                self.uuid,
                event.application_uuid()
            );
        }

        self.run_handler(&event);

        if event.is_event_type(EslEventType::ChannelDestroy) {
            return Some(EslError::channel_closed(&self.uuid));
        }
        None
    }

    fn run_handler(&mut self, event: &EslEvent) {
        let Some(handler) = event
            .event_name()
            .and_then(|name| self.handlers.get(name))
        else {
            return;
        };
        let handler = handler.clone();
        let event = event.clone();
        self.tasks
            .spawn(async move { handler(event).await });
    }

    async fn drain_handlers(&mut self) {
        if self
            .tasks
            .is_empty()
        {
            return;
        }
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while tasks
                .join_next()
                .await
                .is_some()
            {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "[SESSION] {} aborting {} event handlers still running",
                self.uuid,
                self.tasks.len()
            );
            self.tasks
                .abort_all();
        }
    }
}
