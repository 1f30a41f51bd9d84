//! Per-call facade handed to applications.
//!
//! A [`Session`] runs dialplan applications one at a time on its call and
//! waits for their `CHANNEL_EXECUTE_COMPLETE`, submits background jobs owned
//! by the call, and manages event handlers. It is `Clone`; every clone talks
//! to the same dispatcher.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    app::dptools::{AppCommand, PlayAndGetDigits},
    command::validate_no_newlines,
    connection::{ConnectionStatus, EslConnection},
    dispatcher::{DispatcherControl, EventHandler},
    error::{EslError, EslResult},
    event::EslEvent,
    router::RouterHandle,
};

struct SessionInner {
    uuid: String,
    park: EslEvent,
    connection: EslConnection,
    router: RouterHandle,
    control: mpsc::UnboundedSender<DispatcherControl>,
    closed: CancellationToken,
    busy: AtomicBool,
    job_timeout: Option<Duration>,
}

/// Handle to one parked call.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.inner.uuid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Clears the busy flag when an `execute` ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0
            .store(false, Ordering::Release);
    }
}

impl Session {
    pub(crate) fn new(
        uuid: String,
        park: EslEvent,
        connection: EslConnection,
        router: RouterHandle,
        control: mpsc::UnboundedSender<DispatcherControl>,
        closed: CancellationToken,
        job_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                uuid,
                park,
                connection,
                router,
                control,
                closed,
                busy: AtomicBool::new(false),
                job_timeout,
            }),
        }
    }

    /// Call id (`Unique-ID`) of the channel.
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// The `CHANNEL_PARK` event that created this session.
    pub fn park_event(&self) -> &EslEvent {
        &self.inner.park
    }

    /// Underlying connection, for `api` calls and other raw commands.
    pub fn connection(&self) -> &EslConnection {
        &self.inner.connection
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .closed
            .is_cancelled()
    }

    /// Resolves once the call is destroyed or the connection fails.
    pub async fn closed(&self) {
        self.inner
            .closed
            .cancelled()
            .await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.inner
            .closed
            .clone()
    }

    /// Error reported to a waiter whose dispatcher went away.
    fn closed_error(&self) -> EslError {
        match self
            .inner
            .connection
            .status()
        {
            ConnectionStatus::Disconnected(reason) => EslError::Disconnected(reason),
            _ => EslError::channel_closed(&self.inner.uuid),
        }
    }

    /// Run a dialplan application on the call and wait for it to finish.
    ///
    /// Returns the matching `CHANNEL_EXECUTE_COMPLETE`. Only one application
    /// may be outstanding per session; a second concurrent call fails with
    /// [`EslError::CommandInProgress`].
    pub async fn execute(&self, app: &str, args: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::new(app, args))
            .await
    }

    /// [`execute`](Self::execute) for a prepared [`AppCommand`].
    pub async fn execute_app(&self, command: &AppCommand) -> EslResult<EslEvent> {
        let uuid = &self.inner.uuid;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        validate_no_newlines(command.app(), "application name")?;
        validate_no_newlines(command.args(), "application argument")?;

        let _busy = BusyGuard::acquire(&self.inner.busy)
            .ok_or_else(|| EslError::CommandInProgress { uuid: uuid.clone() })?;

        let app_uuid = Uuid::new_v4().to_string();
        let (slot, completion) = oneshot::channel();
        self.inner
            .control
            .send(DispatcherControl::Arm {
                app_uuid: app_uuid.clone(),
                slot,
            })
            .map_err(|_| self.closed_error())?;

        debug!("[SESSION] {} execute {} ({})", uuid, command, app_uuid);
        let headers = command.execute_headers(&app_uuid);
        self.inner
            .connection
            .send_with_headers(Some(uuid.as_str()), &headers, None)
            .await?
            .into_result()?;

        completion
            .await
            .unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Run `command` through `bgapi` on behalf of this call.
    ///
    /// The job is failed with [`EslError::ChannelClosed`] if the call is
    /// destroyed first. On timeout a late result is discarded.
    pub async fn submit_job(&self, command: &str, timeout: Option<Duration>) -> EslResult<EslEvent> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .router
            .submit_job(Some(&self.inner.uuid), command, timeout)
            .await
    }

    /// [`submit_job`](Self::submit_job) with the router's default timeout.
    pub async fn exec_bg_api(&self, command: &str) -> EslResult<EslEvent> {
        self.submit_job(command, self.inner.job_timeout)
            .await
    }

    pub async fn set(&self, name: &str, value: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::set(name, value))
            .await
    }

    pub async fn unset(&self, name: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::unset(name))
            .await
    }

    pub async fn multiset<K, V>(&self, vars: &[(K, V)]) -> EslResult<EslEvent>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.execute_app(&AppCommand::multiset(vars))
            .await
    }

    pub async fn multiunset<N: AsRef<str>>(&self, names: &[N]) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::multiunset(names))
            .await
    }

    pub async fn answer(&self) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::answer())
            .await
    }

    pub async fn pre_answer(&self) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::pre_answer())
            .await
    }

    /// Hang up with `cause`, `NORMAL_CLEARING` when `None`.
    pub async fn hangup(&self, cause: Option<&str>) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::hangup(cause))
            .await
    }

    pub async fn playback(&self, path: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::playback(path))
            .await
    }

    pub async fn bridge(&self, dial_string: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::bridge(dial_string))
            .await
    }

    pub async fn voicemail(&self, profile: &str, domain: &str, user: &str) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::voicemail(profile, domain, user))
            .await
    }

    /// Fire an event from the channel with the given headers.
    pub async fn send_event<K, V>(&self, headers: &[(K, V)]) -> EslResult<EslEvent>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.execute_app(&AppCommand::event(headers))
            .await
    }

    /// Collected digits are in the completion event as
    /// `variable_<var_name>`.
    pub async fn play_and_get_digits(&self, params: &PlayAndGetDigits) -> EslResult<EslEvent> {
        self.execute_app(&AppCommand::play_and_get_digits(params))
            .await
    }

    /// Play `path` and collect a single digit.
    pub async fn play_and_get_one_digit(&self, path: &str) -> EslResult<u32> {
        let var_name = format!(
            "pagd_{}",
            Uuid::new_v4().simple()
        );
        let params = PlayAndGetDigits::one_digit(path, &var_name);
        let event = self
            .play_and_get_digits(&params)
            .await?;
        let digit = event
            .variable(&var_name)
            .unwrap_or_default();
        digit
            .parse()
            .map_err(|_| EslError::UnexpectedReply {
                reply_text: format!("no digit collected (got {:?})", digit),
            })
    }

    /// Run `handler` on its own task for every event named `name`.
    ///
    /// Replaces any handler already registered under that name.
    pub fn add_event_handler<F, Fut>(&self, name: &str, handler: F) -> EslResult<()>
    where
        F: Fn(EslEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event: EslEvent| {
            handler(event)
                .boxed()
        });
        self.send_control(DispatcherControl::AddHandler {
            name: name.to_string(),
            handler,
        })
    }

    pub fn remove_event_handler(&self, name: &str) -> EslResult<()> {
        self.send_control(DispatcherControl::RemoveHandler {
            name: name.to_string(),
        })
    }

    fn send_control(&self, control: DispatcherControl) -> EslResult<()> {
        self.inner
            .control
            .send(control)
            .map_err(|_| self.closed_error())
    }
}
