//! In-memory FreeSWITCH stand-in for integration tests.
//!
//! The mock side of a `tokio::io::duplex` pipe answers every command with
//! `+OK` (bgapi gets its `Job-UUID` echoed back) and records it, so tests can
//! inspect what was sent and inject events in reply.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use freeswitch_esl_session::{
    AppHost, EslConnectOptions, EslConnection, EslEvent, EslEventType, EslResult, EslRouter,
    RouterHandle, RouterOptions,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A `sendmsg ... call-command: execute` as seen by the switch.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub uuid: String,
    pub app: String,
    pub args: String,
    pub event_uuid: String,
}

pub struct MockSwitch {
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    commands: mpsc::UnboundedReceiver<String>,
    reject_sendmsg: Arc<AtomicBool>,
}

/// Install a `RUST_LOG`-filtered subscriber; later calls are no-ops.
///
/// Run with: RUST_LOG=freeswitch_esl_session=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn connect() -> (EslConnection, freeswitch_esl_session::EslEventStream, MockSwitch) {
    connect_with(EslConnectOptions::default())
}

pub fn connect_with(
    options: EslConnectOptions,
) -> (EslConnection, freeswitch_esl_session::EslEventStream, MockSwitch) {
    init_tracing();
    let (client, server) = tokio::io::duplex(256 * 1024);
    let (connection, events) = EslConnection::from_stream(client, options);
    let (read_half, write_half) = tokio::io::split(server);

    let writer = Arc::new(Mutex::new(write_half));
    let reject_sendmsg = Arc::new(AtomicBool::new(false));
    let (commands_tx, commands) = mpsc::unbounded_channel();
    tokio::spawn(serve(
        read_half,
        writer.clone(),
        commands_tx,
        reject_sendmsg.clone(),
    ));

    (
        connection,
        events,
        MockSwitch {
            writer,
            commands,
            reject_sendmsg,
        },
    )
}

/// Connection, router on its own task, and the mock behind them.
pub fn start_router(
    host: AppHost,
    options: RouterOptions,
) -> (RouterHandle, JoinHandle<EslResult<()>>, MockSwitch) {
    start_router_with(host, options, EslConnectOptions::default())
}

pub fn start_router_with(
    host: AppHost,
    options: RouterOptions,
    connect_options: EslConnectOptions,
) -> (RouterHandle, JoinHandle<EslResult<()>>, MockSwitch) {
    let (connection, events, mock) = connect_with(connect_options);
    let router = EslRouter::new(connection, events, host, options);
    let handle = router.handle();
    let task = tokio::spawn(router.run());
    (handle, task, mock)
}

async fn serve(
    read_half: ReadHalf<DuplexStream>,
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    commands: mpsc::UnboundedSender<String>,
    reject_sendmsg: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut command = String::new();
        loop {
            let mut line = String::new();
            match reader
                .read_line(&mut line)
                .await
            {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if line == "\n" {
                break;
            }
            command.push_str(&line);
        }

        let reply = if command.starts_with("bgapi ") {
            let job_uuid = header_value(&command, "Job-UUID").unwrap_or_default();
            format!(
                "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {0}\nJob-UUID: {0}\n\n",
                job_uuid
            )
        } else if command.starts_with("sendmsg ") && reject_sendmsg.swap(false, Ordering::SeqCst) {
            "Content-Type: command/reply\nReply-Text: -ERR invalid session id\n\n".to_string()
        } else {
            "Content-Type: command/reply\nReply-Text: +OK\n\n".to_string()
        };

        let _ = commands.send(command);
        let mut writer = writer
            .lock()
            .await;
        if writer
            .write_all(reply.as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

fn header_value(command: &str, name: &str) -> Option<String> {
    command
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(": "))
        .map(str::to_string)
}

impl MockSwitch {
    /// Next command the client wrote, without the terminating blank line.
    pub async fn next_command(&mut self) -> String {
        self.commands
            .recv()
            .await
            .expect("mock switch stopped")
    }

    pub async fn next_execute(&mut self) -> ExecuteRequest {
        let command = self
            .next_command()
            .await;
        let uuid = command
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("sendmsg "))
            .expect("expected sendmsg")
            .to_string();
        assert_eq!(
            header_value(&command, "call-command").as_deref(),
            Some("execute")
        );
        ExecuteRequest {
            uuid,
            app: header_value(&command, "execute-app-name").unwrap_or_default(),
            args: header_value(&command, "execute-app-arg").unwrap_or_default(),
            event_uuid: header_value(&command, "Event-UUID").expect("execute without Event-UUID"),
        }
    }

    /// Returns `(command, job_uuid)` of the next `bgapi`.
    pub async fn next_bgapi(&mut self) -> (String, String) {
        let command = self
            .next_command()
            .await;
        let line = command
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("bgapi "))
            .expect("expected bgapi")
            .to_string();
        let job_uuid = header_value(&command, "Job-UUID").expect("bgapi without Job-UUID");
        (line, job_uuid)
    }

    /// Answer the next `sendmsg` with `-ERR`.
    pub fn reject_next_sendmsg(&self) {
        self.reject_sendmsg
            .store(true, Ordering::SeqCst);
    }

    pub async fn send_event(&self, event: &EslEvent) {
        self.send_events(std::slice::from_ref(event))
            .await;
    }

    /// Write all `events` with a single socket write.
    pub async fn send_events(&self, events: &[EslEvent]) {
        let mut message = String::new();
        for event in events {
            let body = event.to_plain_format();
            message.push_str(&format!(
                "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
                body.len(),
                body
            ));
        }
        self.writer
            .lock()
            .await
            .write_all(message.as_bytes())
            .await
            .expect("client side closed");
    }

    /// Close the switch side of the socket.
    pub async fn close(&self) {
        let _ = self
            .writer
            .lock()
            .await
            .shutdown()
            .await;
    }
}

pub fn channel_event(event_type: EslEventType, uuid: &str) -> EslEvent {
    let mut event = EslEvent::with_type(event_type);
    event.set_header("Unique-ID", uuid);
    event
}

pub fn park(uuid: &str) -> EslEvent {
    let mut event = channel_event(EslEventType::ChannelPark, uuid);
    event.set_header("Channel-Name", format!("sofia/internal/{}", uuid));
    event.set_header("variable_esl_manage", "true");
    event
}

pub fn execute_complete(request: &ExecuteRequest) -> EslEvent {
    let mut event = channel_event(EslEventType::ChannelExecuteComplete, &request.uuid);
    event.set_header("Application", request.app.as_str());
    event.set_header("Application-Data", request.args.as_str());
    event.set_header("Application-UUID", request.event_uuid.as_str());
    event.set_header("Application-Response", "_none_");
    event
}

pub fn destroy(uuid: &str) -> EslEvent {
    let mut event = channel_event(EslEventType::ChannelDestroy, uuid);
    event.set_header("Hangup-Cause", "NORMAL_CLEARING");
    event
}

pub fn background_job(job_uuid: &str, result: &str) -> EslEvent {
    let mut event = EslEvent::with_type(EslEventType::BackgroundJob);
    event.set_header("Job-UUID", job_uuid);
    event.set_body(result);
    event
}
