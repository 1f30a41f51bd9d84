//! Application host: one user application per parked call.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::{event::EslEvent, router::RouterOptions, session::Session};

/// Call-handling application.
///
/// A fresh instance is built by the [`AppHost`] factory for every
/// `CHANNEL_PARK`. When [`is_applicable`](Self::is_applicable) declines the
/// call, the instance is dropped and the call is left alone.
#[async_trait]
pub trait EslApp: Send {
    fn is_applicable(&self, park: &EslEvent) -> bool {
        let _ = park;
        true
    }

    /// Runs synchronously before [`run`](Self::run) is spawned.
    fn setup(&mut self, park: &EslEvent) {
        let _ = park;
    }

    async fn run(self: Box<Self>);
}

type AppFactory = Box<dyn Fn(Session) -> Box<dyn EslApp> + Send + Sync>;

/// Builds and launches applications for new calls.
pub struct AppHost {
    factory: AppFactory,
}

impl std::fmt::Debug for AppHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHost")
            .finish_non_exhaustive()
    }
}

impl AppHost {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Session) -> Box<dyn EslApp> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    /// Returns `false` when the application declined the call.
    pub(crate) fn start(&self, session: Session, options: &RouterOptions) -> bool {
        let park = session
            .park_event()
            .clone();
        let uuid = session
            .uuid()
            .to_string();
        let closed = session.close_token();

        let mut app = (self.factory)(session);
        if !app.is_applicable(&park) {
            return false;
        }
        app.setup(&park);

        let grace = options.app_grace_period;
        tokio::spawn(async move {
            let run = AssertUnwindSafe(app.run()).catch_unwind();
            tokio::pin!(run);
            let expired = async {
                closed
                    .cancelled()
                    .await;
                tokio::time::sleep(grace).await;
            };

            tokio::select! {
                biased;
                outcome = &mut run => match outcome {
                    Ok(()) => debug!("[SESSION] {} application finished", uuid),
                    Err(panic) => error!(
                        "[SESSION] {} application panicked: {}",
                        uuid,
                        panic_message(&*panic)
                    ),
                },
                _ = expired => warn!(
                    "[SESSION] {} application still running {}ms after close, aborting",
                    uuid,
                    grace.as_millis()
                ),
            }
        });
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
