//! Contract Test: Probing and Conflict Resolution
//!
//! Two responders on one link that claim the same unique record must not
//! both keep it.
//!
//! Constraints verified:
//! - Simultaneous probes are settled by the rdata tie-break: exactly one Conflict
//! - Probes ask for the name with type ANY and carry the proposed record
//! - The first probe requests a unicast response, later ones do not
//! - A quiet network verifies after three probes and two announcements
//! - A service that meets an existing owner renames itself to "Name (2)"
//! - A conflicting answer for an announced record triggers a new round of
//!   probes; losing that round ends the registration with Conflict
//! - A unique record probes again when its interface comes back
//! - A responder hearing its own packets does not conflict with itself
//! - A host name already answered on the link moves to "name-2"

mod common;

use common::*;
use mdns_core::record::rdata;
use mdns_core::traits::InterfaceInfo;
use mdns_core::transport::MemoryNetwork;
use mdns_core::{
    DomainName, EngineEvent, InterfaceIndex, RecordFlags, RegistrationEvent, ServiceSpec, rrclass,
    rrtype,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn quiet_network_probes_three_times_then_announces_twice() {
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
            120,
        )
        .unwrap();

    match next_outcome(&mut listener).await {
        RegistrationEvent::Registered { handle: h, name } => {
            assert_eq!(h, handle);
            assert_eq!(name, DomainName::parse("foo.local.").unwrap());
        }
        other => panic!("expected Registered, got {:?}", other),
    }

    // Let the second announcement go out
    settle(Duration::from_secs(3)).await;

    let sent = responder.sent_messages();
    let probes = probes(&sent);
    assert_eq!(probes.len(), 3, "exactly three probes on a quiet network");
    for (i, probe) in probes.iter().enumerate() {
        let question = &probe.questions[0];
        assert_eq!(question.name, DomainName::parse("foo.local.").unwrap());
        assert_eq!(question.qtype, rrtype::ANY);
        assert_eq!(question.unicast_response, i == 0);
        assert_eq!(probe.authorities.len(), 1);
        assert_eq!(probe.authorities[0].rdata, b"\x03v=1".to_vec());
        assert!(!probe.authorities[0].cache_flush);
    }

    let announced = answers(&sent);
    assert_eq!(announced.len(), 2, "exactly two announcements");
    for record in announced {
        assert_eq!(record.ttl, 120);
        assert!(record.cache_flush, "unique records set the cache-flush bit");
    }

    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn simultaneous_probes_yield_exactly_one_conflict() {
    let network = MemoryNetwork::new();
    let mut alpha = RunningResponder::start(&network, "alpha").await;
    let mut beta = RunningResponder::start(&network, "beta").await;

    let (alpha_registrar, mut alpha_listener) = alpha.client.create_record_registrar().unwrap();
    let (beta_registrar, mut beta_listener) = beta.client.create_record_registrar().unwrap();

    // Same key, different rdata; the lexicographically greater rdata wins
    let lower = alpha_registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=1",
            120,
        )
        .unwrap();
    let higher = beta_registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=2",
            120,
        )
        .unwrap();

    let alpha_outcome = next_outcome(&mut alpha_listener).await;
    let beta_outcome = next_outcome(&mut beta_listener).await;

    assert!(
        matches!(alpha_outcome, RegistrationEvent::Conflict { handle, .. } if handle == lower),
        "lower rdata loses: {:?}",
        alpha_outcome
    );
    assert!(
        matches!(beta_outcome, RegistrationEvent::Registered { handle, .. } if handle == higher),
        "higher rdata wins: {:?}",
        beta_outcome
    );

    // The losing handle is gone
    let err = alpha_registrar
        .remove_record(&lower, RecordFlags::NONE)
        .unwrap_err();
    assert!(matches!(err, mdns_core::Error::NotFound(_)));

    settle(Duration::from_secs(3)).await;
    let conflicts = alpha
        .drain_events()
        .into_iter()
        .chain(beta.drain_events())
        .filter(|e| matches!(e, EngineEvent::Conflict { .. }))
        .count();
    assert_eq!(conflicts, 1, "exactly one side reports a conflict");

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(start_paused = true)]
async fn service_meeting_an_owner_is_renamed() {
    let network = MemoryNetwork::new();
    let alpha = RunningResponder::start(&network, "alpha").await;
    let beta = RunningResponder::start(&network, "beta").await;

    let (owner, mut owner_listener) = alpha
        .client
        .register_service(ServiceSpec::new("_ipp._tcp", 631).name("Printer"))
        .unwrap();
    assert!(matches!(
        next_outcome(&mut owner_listener).await,
        RegistrationEvent::Registered { .. }
    ));

    // Same instance name, different port: the owner's SRV answer conflicts
    let (late, mut late_listener) = beta
        .client
        .register_service(ServiceSpec::new("_ipp._tcp", 632).name("Printer"))
        .unwrap();

    let expected = DomainName::parse("Printer (2)._ipp._tcp.local.").unwrap();
    match next_outcome(&mut late_listener).await {
        RegistrationEvent::Registered { name, .. } => assert_eq!(name, expected),
        other => panic!("expected a renamed registration, got {:?}", other),
    }
    assert_eq!(late.name(), expected);
    assert_eq!(
        owner.name(),
        DomainName::parse("Printer._ipp._tcp.local.").unwrap()
    );

    // The PTR now points at the new instance name
    let ptr = rdata::ptr(&expected);
    let sent = beta.sent_messages();
    assert!(
        answers(&sent)
            .iter()
            .any(|rr| rr.rrtype == rrtype::PTR && rr.rdata == ptr && rr.ttl > 0),
        "renamed PTR is announced"
    );
}

#[tokio::test(start_paused = true)]
async fn no_auto_rename_reports_conflict() {
    let network = MemoryNetwork::new();
    let alpha = RunningResponder::start(&network, "alpha").await;
    let beta = RunningResponder::start(&network, "beta").await;

    let (_owner, mut owner_listener) = alpha
        .client
        .register_service(ServiceSpec::new("_http._tcp", 80).name("Web"))
        .unwrap();
    assert!(matches!(
        next_outcome(&mut owner_listener).await,
        RegistrationEvent::Registered { .. }
    ));

    let (late, mut late_listener) = beta
        .client
        .register_service(ServiceSpec::new("_http._tcp", 8080).name("Web").no_auto_rename())
        .unwrap();

    match next_outcome(&mut late_listener).await {
        RegistrationEvent::Conflict { name, .. } => {
            assert_eq!(name, DomainName::parse("Web._http._tcp.local.").unwrap())
        }
        other => panic!("expected Conflict, got {:?}", other),
    }

    // Operations on the ended registration fail
    let err = late
        .add_record(RecordFlags::NONE, rrtype::A, &rdata::a([10, 0, 0, 1].into()), 0)
        .unwrap_err();
    assert!(matches!(err, mdns_core::Error::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn same_name_held_locally_conflicts() {
    let network = MemoryNetwork::new();
    let responder = RunningResponder::start(&network, "alpha").await;

    let (registrar, mut listener) = responder.client.create_record_registrar().unwrap();
    registrar
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
    assert!(matches!(
        next_outcome(&mut listener).await,
        RegistrationEvent::Registered { .. }
    ));

    let second = registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=2",
            0,
        )
        .unwrap();
    match next_outcome(&mut listener).await {
        RegistrationEvent::Conflict { handle, .. } => assert_eq!(handle, second),
        other => panic!("expected Conflict, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn announced_record_reprobes_then_conflicts() {
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
            120,
        )
        .unwrap();
    assert!(matches!(
        next_outcome(&mut listener).await,
        RegistrationEvent::Registered { .. }
    ));
    settle(Duration::from_secs(3)).await;
    responder.transport.clear_sent();
    responder.drain_events();

    // Another host answers with different data for our verified record
    network.inject(1, foreign_answer("foo.local.", rrtype::TXT, b"\x03v=9"));
    settle(Duration::from_millis(10)).await;

    assert!(
        responder
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Reprobing { name, .. } if name == "foo.local.")),
        "the record goes back to probing"
    );
    let sent = responder.sent_messages();
    let probes = probes(&sent);
    assert_eq!(probes.len(), 1, "one probe of the new round so far");
    assert_eq!(probes[0].authorities[0].rdata, b"\x03v=1".to_vec());

    // The other host defends its data while we probe: we lose the name
    network.inject(1, foreign_answer("foo.local.", rrtype::TXT, b"\x03v=9"));
    match next_outcome(&mut listener).await {
        RegistrationEvent::Conflict { handle: h, name } => {
            assert_eq!(h, handle);
            assert_eq!(name, DomainName::parse("foo.local.").unwrap());
        }
        other => panic!("expected Conflict, got {:?}", other),
    }

    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unique_record_reprobes_when_its_interface_returns() {
    let network = MemoryNetwork::new();
    let mut responder = RunningResponder::start(&network, "alpha").await;

    let (registrar, mut listener) = responder.client.create_record_registrar().unwrap();
    registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex(1),
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=1",
            0,
        )
        .unwrap();
    assert!(matches!(
        next_outcome(&mut listener).await,
        RegistrationEvent::Registered { .. }
    ));
    settle(Duration::from_secs(3)).await;

    responder.transport.interface_down(InterfaceIndex(1));
    settle(Duration::from_millis(10)).await;
    responder.transport.clear_sent();

    responder.transport.interface_up(InterfaceInfo::new(1, "mem0"));
    settle(Duration::from_secs(3)).await;

    let sent = responder.sent_messages();
    assert_eq!(probes(&sent).len(), 3, "the name is verified again");
    assert_eq!(answers(&sent).len(), 2, "then announced twice");
    assert!(
        !responder
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Conflict { .. }))
    );

    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn own_echoed_packets_are_not_conflicts() {
    let network = MemoryNetwork::with_loopback();
    let mut responder =
        RunningResponder::start_on(&network, test_config("alpha"), vec![addressed_link(10)])
            .await;

    let (registrar, mut record_listener) = responder.client.create_record_registrar().unwrap();
    registrar
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
    let (service, mut service_listener) = responder
        .client
        .register_service(ServiceSpec::new("_http._tcp", 80).name("Web"))
        .unwrap();

    assert!(matches!(
        next_outcome(&mut record_listener).await,
        RegistrationEvent::Registered { .. }
    ));
    match next_outcome(&mut service_listener).await {
        RegistrationEvent::Registered { name, .. } => {
            assert_eq!(name, DomainName::parse("Web._http._tcp.local.").unwrap())
        }
        other => panic!("expected Registered, got {:?}", other),
    }
    settle(Duration::from_secs(3)).await;

    let sent = responder.sent_messages();
    let foo = DomainName::parse("foo.local.").unwrap();
    let foo_probes = probes(&sent)
        .iter()
        .filter(|m| m.questions[0].name == foo)
        .count();
    assert_eq!(foo_probes, 3, "no extra round caused by our own echoes");
    assert_eq!(service.name(), DomainName::parse("Web._http._tcp.local.").unwrap());
    assert!(!responder.drain_events().iter().any(|e| matches!(
        e,
        EngineEvent::Conflict { .. }
            | EngineEvent::Renamed { .. }
            | EngineEvent::HostRenamed { .. }
            | EngineEvent::Reprobing { .. }
    )));

    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn responders_sharing_a_host_still_see_each_other() {
    // Loopback on: both responders hear their own packets and each other's
    let network = MemoryNetwork::with_loopback();
    let mut alpha = RunningResponder::start(&network, "alpha").await;
    let mut beta = RunningResponder::start(&network, "beta").await;

    let (alpha_registrar, mut alpha_listener) = alpha.client.create_record_registrar().unwrap();
    alpha_registrar
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
    assert!(matches!(
        next_outcome(&mut alpha_listener).await,
        RegistrationEvent::Registered { .. }
    ));

    let (beta_registrar, mut beta_listener) = beta.client.create_record_registrar().unwrap();
    beta_registrar
        .register_record(
            RecordFlags::UNIQUE,
            InterfaceIndex::ANY,
            "foo.local.",
            rrtype::TXT,
            rrclass::IN,
            b"\x03v=2",
            0,
        )
        .unwrap();
    assert!(matches!(
        next_outcome(&mut beta_listener).await,
        RegistrationEvent::Conflict { .. }
    ));

    settle(Duration::from_secs(3)).await;
    let conflicts = alpha
        .drain_events()
        .into_iter()
        .chain(beta.drain_events())
        .filter(|e| matches!(e, EngineEvent::Conflict { .. }))
        .count();
    assert_eq!(conflicts, 1);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(start_paused = true)]
async fn host_name_taken_on_the_link_is_renamed() {
    let network = MemoryNetwork::new();
    let mut alpha =
        RunningResponder::start_on(&network, test_config("alpha"), vec![addressed_link(10)])
            .await;
    settle(Duration::from_secs(3)).await;
    let alpha_sent = alpha.sent_messages();
    let host = DomainName::parse("alpha.local.").unwrap();
    assert!(
        answers(&alpha_sent)
            .iter()
            .any(|rr| rr.name == host && rr.rrtype == rrtype::A && rr.rdata == [192, 168, 1, 10]),
        "the host name is announced"
    );

    // A second host configured with the same name joins the link
    let mut beta =
        RunningResponder::start_on(&network, test_config("alpha"), vec![addressed_link(11)])
            .await;
    settle(Duration::from_secs(5)).await;

    let renamed = beta.drain_events().into_iter().find_map(|e| match e {
        EngineEvent::HostRenamed { from, to } => Some((from, to)),
        _ => None,
    });
    assert_eq!(
        renamed,
        Some(("alpha.local.".to_string(), "alpha-2.local.".to_string()))
    );
    let moved = DomainName::parse("alpha-2.local.").unwrap();
    let beta_sent = beta.sent_messages();
    assert!(
        answers(&beta_sent)
            .iter()
            .any(|rr| rr.name == moved && rr.rrtype == rrtype::A && rr.rdata == [192, 168, 1, 11]),
        "the renamed host is announced"
    );
    assert!(
        !alpha
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::HostRenamed { .. })),
        "the first owner keeps its name"
    );

    alpha.stop().await;
    beta.stop().await;
}
