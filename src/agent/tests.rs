use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::config::ChannelSettings;
use crate::message::headers::{
    NEEDS_CONFIG_HEADER, PRIORITY_HEADER, REMOTE_CREDENTIALS_CHARSET_HEADER,
    REMOTE_CREDENTIALS_HEADER, SUBTOPIC_HEADER,
};
use crate::message::{
    AUTHENTICATION_FAULT, CONNECT_FAULT, CommandOperation, Headers, MESSAGE_SEND_FAULT, Message,
    SUBSCRIBE_FAULT,
};
use crate::transport::mock::{self, MockTransport};
use crate::utils::encode_credentials;
use crate::utils::error::SessionError;

fn drain(events: &mut UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn fault_codes(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.fault_code().map(str::to_string))
        .collect()
}

fn count(transport: &MockTransport, operation: CommandOperation) -> usize {
    transport
        .operations()
        .into_iter()
        .filter(|op| *op == operation)
        .count()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn expire_session(transport: &MockTransport, select: impl Fn(&Message) -> bool) -> Message {
    transport
        .respond(select, |request| {
            Message::error_for(request, AUTHENTICATION_FAULT, "Session expired", "")
        })
        .expect("no matching request outstanding")
}

/// Faults every pending subscribe with a retryable server error.
fn fault_subscribes(transport: &MockTransport) -> usize {
    let mut faulted = 0;
    while transport
        .respond(
            |m| m.is_command(CommandOperation::Subscribe),
            |request| {
                let mut error = Message::error_for(request, "Server.Busy", "Try again", "");
                error
                    .headers
                    .insert(crate::message::headers::RETRYABLE_HINT_HEADER, true);
                error
            },
        )
        .is_some()
    {
        faulted += 1;
    }
    faulted
}

#[tokio::test]
async fn queued_sends_flush_in_order_once_client_id_is_known() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    let mut events = producer.events();
    let messages: Vec<Message> = (0..4)
        .map(|i| Message::new_async().with_body(i))
        .collect();
    for message in &messages {
        producer.send(message.clone()).unwrap();
    }
    assert_eq!(producer.agent().queued(), 3);

    let transport = factory.transport("ch1");
    transport.open();
    // trigger-connect and the first message only
    assert_eq!(transport.pending().len(), 2);
    assert_eq!(count(&transport, CommandOperation::TriggerConnect), 1);

    transport.ack_command(CommandOperation::TriggerConnect, None).unwrap();
    assert_eq!(producer.agent().queued(), 3);
    transport.ack_next(Some("P-1")).unwrap();
    assert_eq!(producer.agent().client_id().as_deref(), Some("P-1"));
    assert_eq!(producer.agent().queued(), 0);

    let sent: Vec<Message> = transport
        .invoked()
        .into_iter()
        .filter(|m| m.operation().is_none())
        .collect();
    let ids: Vec<&str> = sent.iter().map(Message::message_id).collect();
    let expected: Vec<&str> = messages.iter().map(Message::message_id).collect();
    assert_eq!(ids, expected);
    assert!(sent[1..].iter().all(|m| m.client_id.as_deref() == Some("P-1")));

    let events = drain(&mut events);
    assert!(events.contains(&AgentEvent::PropertyChange(PropertyChange::ClientId(Some(
        "P-1".into()
    )))));
}

#[tokio::test]
async fn one_identity_request_in_flight_when_ack_carries_no_client_id() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.subscribe(None).unwrap();
    consumer.receive().unwrap();
    consumer.receive().unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    assert_eq!(transport.operations(), vec![CommandOperation::Subscribe]);
    transport.fault_next("Server.Error", false).unwrap();
    // no id learned: exactly one more goes out
    assert_eq!(
        transport.operations(),
        vec![CommandOperation::Subscribe, CommandOperation::Poll]
    );
    assert_eq!(consumer.agent().queued(), 1);

    transport.ack_next(Some("C-1")).unwrap();
    assert_eq!(
        transport.operations(),
        vec![
            CommandOperation::Subscribe,
            CommandOperation::Poll,
            CommandOperation::Poll
        ]
    );
}

#[tokio::test]
async fn subscribe_ack_registers_consumer() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    let mut events = consumer.events();
    consumer.set_selector(Some("price > 10".into())).unwrap();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    let subscribe = transport
        .respond(
            |m| m.is_command(CommandOperation::Subscribe),
            |request| {
                let mut ack = Message::acknowledge_for(request);
                ack.client_id = Some("C-1".into());
                ack.timestamp = 1_700;
                ack
            },
        )
        .unwrap();

    assert_eq!(
        subscribe.headers.get_str(crate::message::headers::SELECTOR_HEADER),
        Some("price > 10")
    );
    assert_eq!(subscribe.destination, "quotes");
    assert!(consumer.subscribed());
    assert_eq!(consumer.client_id().as_deref(), Some("C-1"));
    assert_eq!(consumer.timestamp(), 1_700);
    assert_eq!(session.dispatcher().consumer_count(), 1);
    assert!(transport.polling_enabled());

    let events = drain(&mut events);
    assert!(events.contains(&AgentEvent::PropertyChange(PropertyChange::Connected(true))));
    assert!(events.contains(&AgentEvent::PropertyChange(PropertyChange::Subscribed(true))));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, AgentEvent::Acknowledge { request, .. } if request.is_command(CommandOperation::Subscribe)))
    );
}

#[tokio::test]
async fn first_message_over_connected_set_asks_for_config() {
    let (session, factory) = mock::session();
    let first = session.consumer("quotes");
    first.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_next(Some("C-1")).unwrap();

    let second = session.producer("quotes");
    second.agent().internal_send(Message::new_async(), false).unwrap();
    second.agent().internal_send(Message::new_async(), false).unwrap();

    let pending = transport.pending();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].headers.contains(NEEDS_CONFIG_HEADER));
    assert!(!pending[1].headers.contains(NEEDS_CONFIG_HEADER));
}

#[tokio::test(start_paused = true)]
async fn resubscribe_budget_bounds_attempts() {
    for k in [1, 3] {
        let (session, factory) = mock::session();
        let consumer = session.consumer("quotes");
        consumer.set_resubscribe_attempts(k);
        consumer.set_resubscribe_interval(Duration::from_secs(1));
        let mut events = consumer.events();
        consumer.subscribe(None).unwrap();
        let transport = factory.transport("ch1");
        transport.open();

        let mut delay = Duration::from_millis(500);
        for _ in 0..(k + 3) {
            fault_subscribes(&transport);
            tokio::time::sleep(delay).await;
            delay = Duration::from_secs(1);
        }

        assert_eq!(count(&transport, CommandOperation::Subscribe), k as usize + 1);
        let events = drain(&mut events);
        assert_eq!(fault_codes(&events), vec![SUBSCRIBE_FAULT.to_string()]);
        assert!(!consumer.should_be_subscribed());
        assert!(!consumer.resubscribing());
    }
}

#[tokio::test(start_paused = true)]
async fn zero_resubscribe_attempts_surface_the_first_fault() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.set_resubscribe_attempts(0);
    let mut events = consumer.events();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    assert_eq!(fault_subscribes(&transport), 1);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(count(&transport, CommandOperation::Subscribe), 1);
    assert_eq!(fault_codes(&drain(&mut events)), vec!["Server.Busy".to_string()]);
    assert!(!consumer.should_be_subscribed());
}

#[tokio::test(start_paused = true)]
async fn unbounded_resubscribe_runs_until_unsubscribed() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.set_resubscribe_attempts(-1);
    consumer.set_resubscribe_interval(Duration::from_secs(1));
    let mut events = consumer.events();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    let mut delay = Duration::from_millis(500);
    for _ in 0..12 {
        fault_subscribes(&transport);
        tokio::time::sleep(delay).await;
        delay = Duration::from_secs(1);
    }
    assert_eq!(count(&transport, CommandOperation::Subscribe), 13);
    assert!(consumer.resubscribing());

    consumer.unsubscribe(false).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&transport, CommandOperation::Subscribe), 13);
    assert!(!consumer.resubscribing());
    assert!(fault_codes(&drain(&mut events)).is_empty());

    // a late retryable fault no longer restarts the timer
    fault_subscribes(&transport);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&transport, CommandOperation::Subscribe), 13);
    assert!(!consumer.resubscribing());
    assert_eq!(fault_codes(&drain(&mut events)), vec!["Server.Busy".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_after_success_stops_the_timer() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.set_resubscribe_attempts(5);
    consumer.set_resubscribe_interval(Duration::from_secs(1));
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    fault_subscribes(&transport);
    tokio::time::sleep(Duration::from_millis(500)).await;
    transport.ack_command(CommandOperation::Subscribe, Some("C-1")).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(consumer.subscribed());
    assert!(!consumer.resubscribing());
    assert_eq!(count(&transport, CommandOperation::Subscribe), 2);
}

#[tokio::test]
async fn disconnect_barrier_drops_late_responses() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    let mut events = consumer.events();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    drain(&mut events);
    let subscribe = transport.pending().pop().unwrap();

    consumer.disconnect();
    // closing the transport failed the outstanding subscribe
    assert!(transport.pending().is_empty());
    let mut ack = Message::acknowledge_for(&subscribe);
    ack.client_id = Some("C-1".into());
    consumer.acknowledge(ack, subscribe);

    assert!(!consumer.subscribed());
    assert_eq!(consumer.client_id(), None);
    let events = drain(&mut events);
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Acknowledge { .. })));
    assert!(fault_codes(&events).is_empty());
    assert!(events.contains(&AgentEvent::PropertyChange(PropertyChange::Connected(false))));
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test]
async fn disconnect_discards_queued_messages() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.subscribe(None).unwrap();
    consumer.receive().unwrap();
    consumer.receive().unwrap();
    assert_eq!(consumer.agent().queued(), 2);

    consumer.disconnect();
    assert_eq!(consumer.agent().queued(), 0);

    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    assert_eq!(transport.operations(), vec![CommandOperation::Subscribe]);
}

#[tokio::test]
async fn error_hint_acknowledgement_is_not_surfaced() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    let mut events = producer.events();
    producer.connect().unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_next(None).unwrap();
    drain(&mut events);

    producer.send(Message::new_async().with_body("x")).unwrap();
    transport
        .respond(
            |_| true,
            |request| {
                let mut ack = Message::acknowledge_for(request);
                ack.client_id = Some("P-1".into());
                ack.headers
                    .insert(crate::message::headers::ERROR_HINT_HEADER, true);
                ack
            },
        )
        .unwrap();

    assert_eq!(producer.agent().client_id().as_deref(), Some("P-1"));
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, AgentEvent::Acknowledge { .. }))
    );
}

#[tokio::test]
async fn authentication_fault_relogs_and_resends_once() {
    let mut settings = mock::settings(&[("quotes", &["ch1"])]);
    settings.channels.insert(
        "ch1".into(),
        ChannelSettings {
            uri: "ws://ch1/messages".into(),
            login_after_disconnect: true,
            ..ChannelSettings::default()
        },
    );
    let (session, factory) = mock::session_with(settings);
    let consumer = session.consumer("quotes");
    let mut events = consumer.events();
    consumer
        .agent()
        .set_credentials("admin", "password", None)
        .unwrap();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_command(CommandOperation::Login, None).unwrap();
    transport.ack_command(CommandOperation::Subscribe, Some("C-1")).unwrap();
    assert!(consumer.agent().authenticated());

    consumer.receive().unwrap();
    let poll = expire_session(&transport, |m| m.is_command(CommandOperation::Poll));
    assert_eq!(transport.connects().len(), 2);

    transport.open();
    assert_eq!(count(&transport, CommandOperation::Login), 2);
    let resent = transport
        .pending()
        .into_iter()
        .find(|m| m.is_command(CommandOperation::Poll))
        .unwrap();
    assert_eq!(resent.message_id(), poll.message_id());
    assert!(!fault_codes(&drain(&mut events)).contains(&AUTHENTICATION_FAULT.to_string()));

    // a second expiry for the same message is reported
    expire_session(&transport, |m| m.is_command(CommandOperation::Poll));
    assert_eq!(
        fault_codes(&drain(&mut events)),
        vec![AUTHENTICATION_FAULT.to_string()]
    );
}

#[tokio::test]
async fn conflicting_credentials_are_rejected() {
    let (session, factory) = mock::session();
    let first = session.consumer("quotes");
    first.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_next(Some("C-1")).unwrap();
    first.agent().set_credentials("admin", "password", None).unwrap();
    transport.ack_command(CommandOperation::Login, None).unwrap();
    assert!(first.agent().authenticated());

    let second = session.producer("quotes");
    second.connect().unwrap();
    assert!(second.agent().authenticated());
    // same credentials are accepted
    second.agent().set_credentials("admin", "password", None).unwrap();
    assert!(matches!(
        second.agent().set_credentials("guest", "guest", None),
        Err(SessionError::CredentialsConflict(_))
    ));
}

#[tokio::test]
async fn missing_destination_is_an_error() {
    let (session, _factory) = mock::session();
    let consumer = session.consumer("");
    assert!(matches!(
        consumer.subscribe(None),
        Err(SessionError::MissingDestination)
    ));
}

#[tokio::test]
async fn producer_merges_default_headers_without_overriding() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    let mut defaults = Headers::new();
    defaults.insert("region", "eu");
    defaults.insert("app", "default");
    producer.set_default_headers(defaults);
    producer.set_subtopic(Some("fx.eur".into()));
    producer.set_priority(Some(12));
    assert_eq!(producer.priority(), Some(9));

    producer
        .send(
            Message::new_async()
                .with_header("app", "mine")
                .with_header(PRIORITY_HEADER, 2),
        )
        .unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    let sent = transport
        .pending()
        .into_iter()
        .find(|m| m.operation().is_none())
        .unwrap();
    assert_eq!(sent.headers.get_str("app"), Some("mine"));
    assert_eq!(sent.headers.get_str("region"), Some("eu"));
    assert_eq!(sent.headers.get_str(SUBTOPIC_HEADER), Some("fx.eur"));
    assert_eq!(sent.headers.get_i64(PRIORITY_HEADER), Some(2));
    assert_eq!(sent.destination, "quotes");
}

#[tokio::test]
async fn producer_without_auto_connect_faults_locally() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    producer.set_auto_connect(false);
    let mut events = producer.events();

    producer.send(Message::new_async()).unwrap();

    assert_eq!(fault_codes(&drain(&mut events)), vec![MESSAGE_SEND_FAULT.to_string()]);
    assert!(factory.transport("ch1").connects().is_empty());
}

#[tokio::test]
async fn producer_connect_fault_is_reported_as_connect_fault() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    let mut events = producer.events();
    producer.connect().unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    transport.fault_next("Server.Denied", false).unwrap();

    let events = drain(&mut events);
    assert_eq!(fault_codes(&events), vec![CONNECT_FAULT.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn producer_reconnect_exhaustion_raises_connect_fault() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    producer.set_reconnect_attempts(1);
    producer.set_reconnect_interval(Duration::from_secs(1));
    let mut events = producer.events();
    producer.connect().unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_next(None).unwrap();

    transport.drop_connection(false);
    assert!(producer.reconnecting());
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!producer.reconnecting());
    assert_eq!(fault_codes(&drain(&mut events)), vec![CONNECT_FAULT.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn retry_timer_first_tick_counts_against_budget() {
    let timer = RetryTimer::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    assert!(timer.start(RetryPolicy::new(2, Duration::from_secs(1)), move |tick| {
        let _ = tx.send(tick);
    }));
    assert!(!timer.start(RetryPolicy::new(2, Duration::from_secs(1)), |_| {}));

    assert_eq!(rx.recv().await, Some(Tick::Attempt(1)));
    assert_eq!(rx.recv().await, Some(Tick::Attempt(2)));
    assert_eq!(rx.recv().await, Some(Tick::Exhausted));
    assert_eq!(timer.phase(), RetryPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn retry_timer_stop_is_idempotent() {
    let timer = RetryTimer::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    timer.start(RetryPolicy::new(-1, Duration::from_secs(1)), move |tick| {
        let _ = tx.send(tick);
    });
    assert_eq!(rx.recv().await, Some(Tick::Attempt(1)));

    timer.stop();
    timer.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
    assert!(!timer.is_running());
    assert!(!RetryPolicy::new(0, Duration::from_secs(1)).enabled());
}

#[tokio::test(start_paused = true)]
async fn connect_failure_keeps_the_subscription_retrying() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.set_resubscribe_attempts(3);
    consumer.set_resubscribe_interval(Duration::from_secs(1));
    let mut events = consumer.events();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");

    transport.fail_connect(false);
    assert!(consumer.should_be_subscribed());
    assert!(consumer.resubscribing());
    assert!(fault_codes(&drain(&mut events)).is_empty());

    settle().await;
    assert_eq!(transport.connects().len(), 2);
    transport.open();
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();
    assert!(consumer.subscribed());
    assert!(!consumer.resubscribing());
    assert_eq!(count(&transport, CommandOperation::Subscribe), 1);
}

#[tokio::test(start_paused = true)]
async fn producer_connect_failure_starts_reconnecting() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    producer.set_reconnect_attempts(2);
    producer.set_reconnect_interval(Duration::from_secs(1));
    let mut events = producer.events();
    producer.connect().unwrap();
    let transport = factory.transport("ch1");

    transport.fail_connect(false);
    assert!(producer.reconnecting());
    assert!(fault_codes(&drain(&mut events)).is_empty());

    settle().await;
    assert_eq!(transport.connects().len(), 2);
    transport.open();
    assert!(producer.connected());
    assert!(!producer.reconnecting());
}

#[tokio::test]
async fn producer_without_reconnect_budget_reports_connect_failure() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    let mut events = producer.events();
    producer.connect().unwrap();

    factory.transport("ch1").fail_connect(false);

    assert!(!producer.reconnecting());
    assert_eq!(fault_codes(&drain(&mut events)), vec![CONNECT_FAULT.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_tick_waits_for_the_outstanding_subscribe() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.set_resubscribe_attempts(3);
    consumer.set_resubscribe_interval(Duration::from_secs(1));
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();

    fault_subscribes(&transport);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count(&transport, CommandOperation::Subscribe), 2);
    // the next tick finds the resent subscribe still unanswered
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(count(&transport, CommandOperation::Subscribe), 2);

    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();
    assert!(consumer.subscribed());
    assert!(!consumer.resubscribing());
}

#[tokio::test(start_paused = true)]
async fn queued_subscribe_is_not_sent_twice_after_failover() {
    let mut settings = mock::settings(&[("quotes", &["ch1"])]);
    settings.channels.get_mut("ch1").unwrap().failover_uris = vec!["ws://backup/messages".into()];
    let (session, factory) = mock::session_with(settings);
    let consumer = session.consumer("quotes");
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");

    transport.fail_connect(false);
    assert!(consumer.resubscribing());
    settle().await;
    assert_eq!(
        transport.connects().last().map(String::as_str),
        Some("ws://backup/messages")
    );
    transport.open();

    let subscribes: Vec<Message> = transport
        .pending()
        .into_iter()
        .filter(|m| m.is_command(CommandOperation::Subscribe))
        .collect();
    assert_eq!(subscribes.len(), 1);
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();
    assert!(consumer.subscribed());
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_resubscribes_on_reconnect() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();

    transport.drop_connection(false);
    assert!(!consumer.subscribed());
    assert!(consumer.resubscribing());
    settle().await;
    transport.open();

    assert_eq!(count(&transport, CommandOperation::Subscribe), 2);
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();
    assert!(consumer.subscribed());
    assert!(!consumer.resubscribing());
    assert_eq!(session.dispatcher().consumer_count(), 1);
}

#[tokio::test]
async fn rejected_drop_does_not_resubscribe() {
    let (session, factory) = mock::session();
    let consumer = session.consumer("quotes");
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();

    transport.drop_connection(true);

    assert!(!consumer.subscribed());
    assert!(!consumer.resubscribing());
}

#[tokio::test(start_paused = true)]
async fn remote_credentials_ride_on_the_first_message_per_connection() {
    let (session, factory) = mock::session();
    let producer = session.producer("quotes");
    producer
        .agent()
        .set_remote_credentials("remote", "secret", Some("UTF-8".into()));
    producer.connect().unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    let connect = transport
        .ack_command(CommandOperation::TriggerConnect, Some("P-1"))
        .unwrap();
    assert!(!connect.headers.contains(REMOTE_CREDENTIALS_HEADER));

    producer.send(Message::new_async().with_body(1)).unwrap();
    producer.send(Message::new_async().with_body(2)).unwrap();
    let sent = transport.pending();
    assert_eq!(sent.len(), 2);
    let expected = encode_credentials("remote", "secret");
    assert_eq!(
        sent[0].headers.get_str(REMOTE_CREDENTIALS_HEADER),
        Some(expected.as_str())
    );
    assert_eq!(
        sent[0].headers.get_str(REMOTE_CREDENTIALS_CHARSET_HEADER),
        Some("UTF-8")
    );
    assert!(!sent[1].headers.contains(REMOTE_CREDENTIALS_HEADER));
    transport.ack_next(None).unwrap();
    transport.ack_next(None).unwrap();

    // a new connection sends them once more
    transport.drop_connection(false);
    settle().await;
    transport.open();
    producer.send(Message::new_async().with_body(3)).unwrap();
    let third = transport.pending().pop().unwrap();
    assert_eq!(
        third.headers.get_str(REMOTE_CREDENTIALS_HEADER),
        Some(expected.as_str())
    );
}

#[tokio::test]
async fn relogin_reconnects_a_shared_channel() {
    let mut settings = mock::settings(&[("a", &["ch1"]), ("b", &["ch1", "ch2"])]);
    settings.channels.get_mut("ch1").unwrap().login_after_disconnect = true;
    let (session, factory) = mock::session_with(settings);
    let transport = factory.transport("ch1");

    let producer = session.producer("a");
    let mut producer_events = producer.events();
    producer
        .agent()
        .set_credentials("admin", "password", None)
        .unwrap();
    producer.connect().unwrap();
    transport.open();
    transport.ack_command(CommandOperation::Login, None).unwrap();
    transport
        .ack_command(CommandOperation::TriggerConnect, None)
        .unwrap();
    assert!(producer.agent().authenticated());

    let consumer = session.consumer("b");
    let mut consumer_events = consumer.events();
    consumer.subscribe(None).unwrap();
    producer.send(Message::new_async().with_body("x")).unwrap();
    let sent = expire_session(&transport, |m| m.operation().is_none());

    // the channel is shared with set b, yet it really reconnects
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(transport.connects().len(), 2);
    assert!(transport.pending().is_empty());

    transport.open();
    assert_eq!(count(&transport, CommandOperation::Login), 2);
    let pending = transport.pending();
    assert!(pending.iter().any(|m| m.message_id() == sent.message_id()));
    assert!(pending.iter().any(|m| m.is_command(CommandOperation::Subscribe)));
    assert!(fault_codes(&drain(&mut consumer_events)).is_empty());
    assert!(fault_codes(&drain(&mut producer_events)).is_empty());

    transport
        .ack_command(CommandOperation::Subscribe, Some("C-B"))
        .unwrap();
    assert!(consumer.subscribed());
}

#[tokio::test(start_paused = true)]
async fn acknowledged_resend_can_be_reauthorized_again() {
    let mut settings = mock::settings(&[("quotes", &["ch1"])]);
    settings.channels.get_mut("ch1").unwrap().login_after_disconnect = true;
    let (session, factory) = mock::session_with(settings);
    let consumer = session.consumer("quotes");
    let mut events = consumer.events();
    consumer
        .agent()
        .set_credentials("admin", "password", None)
        .unwrap();
    consumer.subscribe(None).unwrap();
    let transport = factory.transport("ch1");
    transport.open();
    transport.ack_command(CommandOperation::Login, None).unwrap();

    expire_session(&transport, |m| m.is_command(CommandOperation::Subscribe));
    transport.open();
    assert_eq!(count(&transport, CommandOperation::Subscribe), 2);
    transport.ack_command(CommandOperation::Login, None).unwrap();
    transport
        .ack_command(CommandOperation::Subscribe, Some("C-1"))
        .unwrap();
    assert!(consumer.subscribed());

    // the resubscribe after a drop reuses the subscribe message
    transport.drop_connection(false);
    settle().await;
    transport.open();
    transport.ack_command(CommandOperation::Login, None).unwrap();
    assert_eq!(count(&transport, CommandOperation::Subscribe), 3);
    expire_session(&transport, |m| m.is_command(CommandOperation::Subscribe));

    assert_eq!(transport.connects().len(), 4);
    assert!(!fault_codes(&drain(&mut events)).contains(&AUTHENTICATION_FAULT.to_string()));
}
