//! Per-call session engine for FreeSWITCH Event Socket (ESL) applications
//!
//! One inbound ESL connection carries the events of many calls. This crate
//! turns that single stream into one [`Session`] per parked call, each with
//! its own application task, so call logic reads as straight-line code:
//! answer, play a prompt, collect digits, hang up.
//!
//! # Architecture
//!
//! - [`EslConnection`] (Clone + Send) writes commands and reads their replies.
//!   A background reader task splits replies from events.
//! - [`EslEventStream`] receives events from the reader.
//! - [`EslRouter`] owns the event stream and the registry of live calls. It
//!   routes each event to its call's dispatcher, resolves background jobs,
//!   and starts a new session for every `CHANNEL_PARK`.
//! - [`Session`] is the per-call facade handed to applications; [`EslApp`]
//!   is what they implement.
//!
//! # Example
//!
//! ```rust,no_run
//! use freeswitch_esl_session::{
//!     AppHost, EslApp, EslConnectOptions, EslConnection, EslError, EslEvent, EslRouter,
//!     EventFormat, RouterOptions, Session,
//! };
//!
//! struct Greeter {
//!     session: Session,
//! }
//!
//! #[async_trait::async_trait]
//! impl EslApp for Greeter {
//!     fn is_applicable(&self, park: &EslEvent) -> bool {
//!         park.variable("esl_manage").is_some()
//!     }
//!
//!     async fn run(self: Box<Self>) {
//!         let _ = self.session.answer().await;
//!         let _ = self.session.playback("ivr/ivr-welcome.wav").await;
//!         let _ = self.session.hangup(None).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let (connection, events) =
//!         EslConnection::connect("localhost", 8021, EslConnectOptions::default()).await?;
//!     connection.auth("ClueCon").await?;
//!
//!     let host = AppHost::new(|session| Box::new(Greeter { session }));
//!     let router = EslRouter::new(connection, events, host, RouterOptions::default());
//!     router.subscribe(EventFormat::Plain).await?;
//!     router.run().await
//! }
//! ```

#[macro_use]
mod macros;

pub mod app;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod host;
pub mod router;
pub mod session;

pub(crate) mod buffer;
pub(crate) mod command;
pub(crate) mod dispatcher;
pub(crate) mod protocol;

pub use app::dptools::{AppCommand, PlayAndGetDigits};
pub use command::{CommandBuilder, EslCommand, EslResponse, ReplyStatus};
pub use connection::{
    ConnectionStatus, DisconnectReason, EslConnectOptions, EslConnection, EslEventStream,
};
pub use constants::DEFAULT_ESL_PORT;
pub use dispatcher::EventHandler;
pub use error::{EslError, EslResult};
pub use event::{EslEvent, EslEventType, EventFormat};
pub use headers::EventHeader;
pub use host::{AppHost, EslApp};
pub use router::{EslRouter, RegistryStats, RouterHandle, RouterOptions};
pub use session::Session;
