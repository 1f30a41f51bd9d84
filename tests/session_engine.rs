//! End-to-end behavior of the router, dispatchers and sessions against the
//! in-memory mock switch.

mod common;

use std::time::Duration;

use async_trait::async_trait;
use common::{
    background_job, channel_event, destroy, execute_complete, park, start_router,
    start_router_with,
};
use freeswitch_esl_session::{
    AppHost, EslApp, EslConnectOptions, EslError, EslEvent, EslEventType, RouterOptions, Session,
};
use tokio::sync::{mpsc, oneshot};

/// Hands its session to the test and stays alive until the call closes.
struct Capture {
    session: Session,
    sessions: mpsc::UnboundedSender<Session>,
}

#[async_trait]
impl EslApp for Capture {
    fn is_applicable(&self, park: &EslEvent) -> bool {
        park.variable("esl_manage")
            .is_some_and(|v| !v.is_empty())
    }

    async fn run(self: Box<Self>) {
        let _ = self
            .sessions
            .send(self.session.clone());
        self.session
            .closed()
            .await;
    }
}

fn capture_host() -> (AppHost, mpsc::UnboundedReceiver<Session>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let host = AppHost::new(move |session| {
        Box::new(Capture {
            session,
            sessions: tx.clone(),
        })
    });
    (host, rx)
}

#[tokio::test]
async fn test_park_execute_complete() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();
    assert_eq!(session.uuid(), "A-1");
    assert_eq!(
        session
            .park_event()
            .channel_name(),
        Some("sofia/internal/A-1")
    );

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.answer().await }
    });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.uuid, "A-1");
    assert_eq!(request.app, "answer");

    // A completion for some earlier command must not resolve this one.
    let mut stale = execute_complete(&request);
    stale.set_header("Application-UUID", "not-ours");
    mock.send_event(&stale)
        .await;
    mock.send_event(&execute_complete(&request))
        .await;

    let completion = call
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        completion.application_uuid(),
        Some(request.event_uuid.as_str())
    );
    assert_eq!(
        router
            .stats()
            .await
            .unwrap()
            .sessions,
        1
    );
}

#[tokio::test]
async fn test_destroy_mid_execute_closes_session() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.playback("ivr/ivr-welcome.wav").await }
    });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.args, "ivr/ivr-welcome.wav");

    mock.send_event(&destroy("A-1"))
        .await;
    let err = call
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EslError::ChannelClosed { ref uuid } if uuid == "A-1"));

    session
        .closed()
        .await;
    assert!(session.is_closed());
    let err = session
        .answer()
        .await
        .unwrap_err();
    assert!(matches!(err, EslError::ChannelClosed { .. }));
    assert_eq!(
        router
            .stats()
            .await
            .unwrap()
            .sessions,
        0
    );
}

#[tokio::test]
async fn test_second_execute_rejected_while_busy() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.execute("sleep", "1000").await }
    });
    let request = mock
        .next_execute()
        .await;

    let err = session
        .execute("sleep", "500")
        .await
        .unwrap_err();
    assert!(matches!(err, EslError::CommandInProgress { .. }));

    mock.send_event(&execute_complete(&request))
        .await;
    first
        .await
        .unwrap()
        .unwrap();

    // Free again once the first command finished.
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.execute("sleep", "500").await }
    });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.args, "500");
    mock.send_event(&execute_complete(&request))
        .await;
    second
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_rejected_sendmsg_fails_execute() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    mock.reject_next_sendmsg();
    let call = tokio::spawn({
        let session = session.clone();
        async move { session.hangup(None).await }
    });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.args, "NORMAL_CLEARING");

    let err = call
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EslError::CommandFailed { .. }));
}

#[tokio::test]
async fn test_sessions_progress_independently() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mut mock) = start_router(host, RouterOptions::default());

    let mut calls = Vec::new();
    let mut requests = Vec::new();
    for uuid in ["A-1", "B-2", "C-3"] {
        mock.send_event(&park(uuid))
            .await;
        let session = sessions
            .recv()
            .await
            .unwrap();
        calls.push(tokio::spawn(async move {
            let event = session
                .playback("ivr/hold.wav")
                .await;
            (session, event)
        }));
        requests.push(
            mock.next_execute()
                .await,
        );
    }

    // A-1 stays pending while the others finish in reverse order.
    for request in requests
        .iter()
        .skip(1)
        .rev()
    {
        mock.send_event(&execute_complete(request))
            .await;
    }
    let first = calls.remove(0);
    for (call, request) in calls
        .into_iter()
        .zip(requests.iter().skip(1))
    {
        let (session, event) = call
            .await
            .unwrap();
        let event = event.unwrap();
        assert_eq!(session.uuid(), request.uuid);
        assert_eq!(event.unique_id(), Some(request.uuid.as_str()));
        assert_eq!(
            event.application_uuid(),
            Some(request.event_uuid.as_str())
        );
    }
    assert!(!first.is_finished());

    mock.send_event(&execute_complete(&requests[0]))
        .await;
    let (_, event) = first
        .await
        .unwrap();
    assert!(event.is_ok());
}

#[tokio::test]
async fn test_non_applicable_park_is_ignored() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mock) = start_router(host, RouterOptions::default());

    let mut unmanaged = park("A-1");
    unmanaged.del_header("variable_esl_manage");
    mock.send_event(&unmanaged)
        .await;
    mock.send_event(&park("B-2"))
        .await;

    // Events are routed in order, so A-1 was seen before B-2 started.
    let session = sessions
        .recv()
        .await
        .unwrap();
    assert_eq!(session.uuid(), "B-2");
    assert_eq!(
        router
            .stats()
            .await
            .unwrap()
            .sessions,
        1
    );
}

#[tokio::test]
async fn test_double_destroy_and_duplicate_job_result() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let job = tokio::spawn({
        let session = session.clone();
        async move { session.exec_bg_api("status").await }
    });
    let (command, job_uuid) = mock
        .next_bgapi()
        .await;
    assert_eq!(command, "status");

    mock.send_event(&background_job(&job_uuid, "+OK UP 0 years"))
        .await;
    mock.send_event(&background_job(&job_uuid, "+OK UP 0 years"))
        .await;
    let result = job
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.body(), Some("+OK UP 0 years"));

    mock.send_event(&destroy("A-1"))
        .await;
    mock.send_event(&destroy("A-1"))
        .await;
    session
        .closed()
        .await;

    // The router is still healthy: a new call starts normally.
    mock.send_event(&park("B-2"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();
    assert_eq!(session.uuid(), "B-2");
    let stats = router
        .stats()
        .await
        .unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.jobs, 0);
}

#[tokio::test]
async fn test_destroy_fails_jobs_owned_by_call() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let owned = tokio::spawn({
        let session = session.clone();
        async move { session.submit_job("originate user/1000 &park", None).await }
    });
    mock.next_bgapi()
        .await;
    let global = tokio::spawn({
        let router = router.clone();
        async move { router.bgapi("status", None).await }
    });
    let (_, global_job) = mock
        .next_bgapi()
        .await;

    mock.send_event(&destroy("A-1"))
        .await;
    let err = owned
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EslError::ChannelClosed { .. }));

    mock.send_event(&background_job(&global_job, "+OK"))
        .await;
    assert!(global
        .await
        .unwrap()
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_job_timeout_ignores_late_result() {
    let (host, mut sessions) = capture_host();
    let (router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let job = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .submit_job("status", Some(Duration::from_secs(1)))
                .await
        }
    });
    let (_, job_uuid) = mock
        .next_bgapi()
        .await;

    let err = job
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EslError::Timeout { timeout_ms: 1000 }));

    mock.send_event(&background_job(&job_uuid, "+OK late"))
        .await;
    assert_eq!(
        router
            .stats()
            .await
            .unwrap()
            .jobs,
        0
    );
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_connection_loss_fails_everything() {
    let (host, mut sessions) = capture_host();
    let (router, task, mut mock) = start_router(host, RouterOptions::default());

    let mut calls = Vec::new();
    let mut parked = Vec::new();
    for uuid in ["A-1", "B-2"] {
        mock.send_event(&park(uuid))
            .await;
        let session = sessions
            .recv()
            .await
            .unwrap();
        parked.push(session.clone());
        calls.push(tokio::spawn(async move {
            session
                .bridge("user/1000")
                .await
        }));
        mock.next_execute()
            .await;
    }
    let job = tokio::spawn({
        let router = router.clone();
        async move { router.bgapi("status", None).await }
    });
    mock.next_bgapi()
        .await;

    mock.close()
        .await;

    for call in calls {
        let err = call
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection_error(), "unexpected error: {err}");
    }
    let err = job
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {err}");

    let err = task
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection_error());

    for session in &parked {
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("session never closed");
        let err = session
            .answer()
            .await
            .unwrap_err();
        assert!(err.is_connection_error(), "unexpected error: {err}");
    }
    // Every app task has ended once the last sender clone is gone.
    let next = tokio::time::timeout(Duration::from_secs(1), sessions.recv())
        .await
        .expect("application tasks still running");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_flooded_session_does_not_block_others() {
    let (host, mut sessions) = capture_host();
    let options = RouterOptions {
        session_queue_size: 1,
        ..Default::default()
    };
    let (router, _task, mut mock) = start_router(host, options);

    let mut parked = Vec::new();
    for uuid in ["A-1", "B-2"] {
        mock.send_event(&park(uuid))
            .await;
        parked.push(
            sessions
                .recv()
                .await
                .unwrap(),
        );
    }
    let (fast, flooded) = (parked[0].clone(), parked[1].clone());

    let call = tokio::spawn({
        let fast = fast.clone();
        async move { fast.answer().await }
    });
    let request = mock
        .next_execute()
        .await;

    // B-2's dispatcher cannot drain 40 events before the router has moved on.
    let mut batch: Vec<EslEvent> = (0..40)
        .map(|_| channel_event(EslEventType::ChannelExecute, "B-2"))
        .collect();
    batch.push(execute_complete(&request));
    mock.send_events(&batch)
        .await;

    let completion = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("fast session blocked by a flooded one")
        .unwrap()
        .unwrap();
    assert_eq!(completion.unique_id(), Some("A-1"));

    let stats = router
        .stats()
        .await
        .unwrap();
    assert_eq!(stats.sessions, 2);
    assert!(stats.dropped_events > 0);

    // The flooded session still works once its queue drains.
    let call = tokio::spawn(async move { flooded.answer().await });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.uuid, "B-2");
    mock.send_event(&execute_complete(&request))
        .await;
    call.await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_small_event_queue_never_loses_completion() {
    let (host, mut sessions) = capture_host();
    let connect_options = EslConnectOptions {
        event_queue_size: 2,
        ..Default::default()
    };
    let (_router, _task, mut mock) =
        start_router_with(host, RouterOptions::default(), connect_options);

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.answer().await }
    });
    let request = mock
        .next_execute()
        .await;

    let mut batch: Vec<EslEvent> = (0..20)
        .map(|_| channel_event(EslEventType::ChannelExecute, "A-1"))
        .collect();
    batch.push(execute_complete(&request));
    mock.send_events(&batch)
        .await;

    let completion = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("completion lost behind a full event queue")
        .unwrap()
        .unwrap();
    assert_eq!(
        completion.application_uuid(),
        Some(request.event_uuid.as_str())
    );
}

#[tokio::test]
async fn test_event_handler_runs_for_named_events() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    session
        .add_event_handler("CHANNEL_ANSWER", move |event: EslEvent| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(event);
            }
        })
        .unwrap();

    mock.send_event(&channel_event(EslEventType::ChannelAnswer, "A-1"))
        .await;
    let event = seen
        .recv()
        .await
        .unwrap();
    assert_eq!(event.unique_id(), Some("A-1"));

    session
        .remove_event_handler("CHANNEL_ANSWER")
        .unwrap();
    mock.send_event(&channel_event(EslEventType::ChannelAnswer, "A-1"))
        .await;
    mock.send_event(&destroy("A-1"))
        .await;
    session
        .closed()
        .await;
    assert!(seen
        .try_recv()
        .is_err());
}

#[tokio::test]
async fn test_play_and_get_one_digit() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let call = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .play_and_get_one_digit("ivr/menu.wav")
                .await
        }
    });
    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.app, "play_and_get_digits");
    let args: Vec<&str> = request
        .args
        .split(' ')
        .collect();
    assert_eq!(args[5], "ivr/menu.wav");
    let var_name = args[7];

    let mut completion = execute_complete(&request);
    completion.set_header(format!("variable_{}", var_name), "7");
    mock.send_event(&completion)
        .await;

    assert_eq!(
        call.await
            .unwrap()
            .unwrap(),
        7
    );
}

#[tokio::test]
async fn test_variable_verbs_wire_arguments() {
    let (host, mut sessions) = capture_host();
    let (_router, _task, mut mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("A-1"))
        .await;
    let session = sessions
        .recv()
        .await
        .unwrap();

    let call = tokio::spawn({
        let session = session.clone();
        async move {
            let set = session
                .multiset(&[("lang", "en"), ("tier", "gold")])
                .await;
            let fired = session
                .send_event(&[("Event-Name", "CUSTOM"), ("Event-Subclass", "demo::done")])
                .await;
            (set, fired)
        }
    });

    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.app, "multiset");
    assert_eq!(request.args, "^^:lang=en:tier=gold");
    mock.send_event(&execute_complete(&request))
        .await;

    let request = mock
        .next_execute()
        .await;
    assert_eq!(request.app, "event");
    assert_eq!(request.args, "Event-Name=CUSTOM,Event-Subclass=demo::done");
    mock.send_event(&execute_complete(&request))
        .await;

    let (set, fired) = call
        .await
        .unwrap();
    set.unwrap();
    fired.unwrap();
}

/// Ignores closure; only an abort stops it.
struct Stubborn {
    _dropped: oneshot::Sender<()>,
}

#[async_trait]
impl EslApp for Stubborn {
    async fn run(self: Box<Self>) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_app_aborted_after_grace_period() {
    let (dropped_tx, dropped_rx) = oneshot::channel();
    let slot = std::sync::Mutex::new(Some(dropped_tx));
    let host = AppHost::new(move |_session| {
        let sender = slot
            .lock()
            .unwrap()
            .take()
            .expect("single call expected");
        Box::new(Stubborn { _dropped: sender })
    });
    let options = RouterOptions {
        app_grace_period: Duration::from_secs(5),
        ..RouterOptions::default()
    };
    let (_router, _task, mock) = start_router(host, options);

    mock.send_event(&park("A-1"))
        .await;
    mock.send_event(&destroy("A-1"))
        .await;

    let started = tokio::time::Instant::now();
    assert!(dropped_rx.await.is_err());
    assert!(started.elapsed() >= Duration::from_secs(5));
}

/// Panics as soon as it runs.
struct Faulty;

#[async_trait]
impl EslApp for Faulty {
    async fn run(self: Box<Self>) {
        panic!("application bug");
    }
}

#[tokio::test]
async fn test_app_panic_is_contained() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let host = AppHost::new(move |session: Session| -> Box<dyn EslApp> {
        if session.uuid() == "BAD" {
            Box::new(Faulty)
        } else {
            Box::new(Capture {
                session,
                sessions: tx.clone(),
            })
        }
    });
    let (router, _task, mock) = start_router(host, RouterOptions::default());

    mock.send_event(&park("BAD"))
        .await;
    mock.send_event(&park("A-1"))
        .await;

    let session = sessions
        .recv()
        .await
        .unwrap();
    assert_eq!(session.uuid(), "A-1");
    assert_eq!(
        router
            .stats()
            .await
            .unwrap()
            .sessions,
        2
    );
}
