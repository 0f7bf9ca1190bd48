//! Contract Test: Shutdown Determinism
//!
//! Shutting the responder down must leave no stale records in other hosts'
//! caches and no registration without an outcome.
//!
//! Constraints verified:
//! - Every announced record is withdrawn with goodbyes (ttl 0), sent twice
//! - run() returns only after the last goodbye went out
//! - Registrations still probing at shutdown receive a Failed outcome
//! - Client calls after shutdown fail with InvalidState
//! - Stopping mid-probe never lets the record reach the wire as announced

mod common;

use common::*;
use mdns_core::error::codes;
use mdns_core::record::rdata;
use mdns_core::transport::MemoryNetwork;
use mdns_core::{
    DomainName, EngineEvent, Error, InterfaceIndex, RecordFlags, RegistrationEvent, ServiceSpec,
    rrclass, rrtype,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn shutdown_sends_goodbyes_twice() {
    let network = MemoryNetwork::new();
    let mut responder = RunningResponder::start(&network, "alpha").await;

    let (_registration, mut listener) = responder
        .client
        .register_service(ServiceSpec::new("_http._tcp", 8080).name("Web"))
        .unwrap();
    assert!(matches!(
        next_outcome(&mut listener).await,
        RegistrationEvent::Registered { .. }
    ));
    settle(Duration::from_secs(2)).await;
    responder.transport.clear_sent();

    responder.stop().await;

    let sent = responder.sent_messages();
    assert_eq!(sent.len(), 2, "one goodbye packet, repeated once");
    for message in &sent {
        assert!(message.is_response());
        // PTR, SRV and TXT
        assert_eq!(message.answers.len(), 3);
        assert!(message.answers.iter().all(|rr| rr.ttl == 0));
    }

    let events = responder.drain_events();
    assert!(matches!(events.last(), Some(EngineEvent::Stopped { .. })));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Withdrawn { records: 3, .. })));
}

#[tokio::test(start_paused = true)]
async fn pending_registration_fails_on_shutdown() {
    let network = MemoryNetwork::new();
    let mut responder = RunningResponder::start(&network, "alpha").await;
    let (registrar, mut listener) = responder.client.create_record_registrar().unwrap();

    let handle = registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=1",
            0,
        )
        .unwrap();

    // Still probing
    settle(Duration::from_millis(100)).await;
    responder.stop().await;

    match next_outcome(&mut listener).await {
        RegistrationEvent::Failed { handle: h, code, .. } => {
            assert_eq!(h, handle);
            assert_eq!(code, codes::NOT_INITIALIZED);
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    // Never announced, so nothing to withdraw
    let sent = responder.sent_messages();
    assert!(answers(&sent).is_empty());

    let err = registrar
        .register_record(
            RecordFlags::SHARED,
            InterfaceIndex::ANY,
            "bar.local.",
            rrtype::TXT,
            rrclass::IN,
            b"",
            0,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "got {:?}", err);
    assert!(matches!(
        responder.client.create_record_registrar(),
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_mid_probe_cancels_announcement() {
    let network = MemoryNetwork::new();
    let mut responder = RunningResponder::start(&network, "alpha").await;

    let (registration, mut listener) = responder
        .client
        .register_service(ServiceSpec::new("_ipp._tcp", 631).name("Printer"))
        .unwrap();

    // Between the second and third probe
    settle(Duration::from_millis(300)).await;
    registration.stop();
    settle(Duration::from_secs(3)).await;

    let sent = responder.sent_messages();
    assert!(!probes(&sent).is_empty());
    assert!(answers(&sent).is_empty(), "a stopped registration is never announced");
    assert!(listener.try_recv().is_err(), "an explicit stop reports nothing");

    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn probes_reaching_no_interface_fail_the_registration() {
    let network = MemoryNetwork::new();
    let mut config = test_config("alpha");
    config.engine.max_send_failures = 2;
    let mut responder = RunningResponder::start_with(&network, config).await;

    network.set_link_down(1, true);
    let (registrar, mut listener) = responder.client.create_record_registrar().unwrap();
    registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::A,
            rrclass::IN,
            &rdata::a([169, 254, 1, 1].into()),
            0,
        )
        .unwrap();

    match next_outcome(&mut listener).await {
        RegistrationEvent::Failed { code, .. } => assert_eq!(code, codes::NOT_INITIALIZED),
        other => panic!("expected Failed, got {:?}", other),
    }

    let events = responder.drain_events();
    assert!(events.iter().any(|e| matches!(e, EngineEvent::SendFailed { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::RegistrationFailed { .. })));

    network.set_link_down(1, false);
    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn interface_return_reannounces_shared_records() {
    let network = MemoryNetwork::new();
    let mut responder = RunningResponder::start(&network, "alpha").await;
    let (registrar, mut listener) = responder.client.create_record_registrar().unwrap();

    let target = DomainName::parse("_http._tcp.local.").unwrap();
    registrar
        .register_record(
            RecordFlags::SHARED,
            InterfaceIndex(1),
            "_services._dns-sd._udp.local.",
            rrtype::PTR,
            rrclass::IN,
            &rdata::ptr(&target),
            0,
        )
        .unwrap();
    assert!(matches!(
        next_outcome(&mut listener).await,
        RegistrationEvent::Registered { .. }
    ));
    settle(Duration::from_secs(2)).await;

    responder.transport.interface_down(InterfaceIndex(1));
    settle(Duration::from_millis(10)).await;
    responder.transport.clear_sent();

    responder
        .transport
        .interface_up(mdns_core::traits::InterfaceInfo::new(1, "mem0"));
    settle(Duration::from_secs(2)).await;

    let sent = responder.sent_messages();
    assert_eq!(answers(&sent).len(), 2, "re-announced after the interface returns");
    assert!(responder
        .client
        .registrations()
        .iter()
        .all(|info| info.verified));

    responder.stop().await;
}
