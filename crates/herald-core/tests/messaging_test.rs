mod common;

use common::{drain_events, link, pump, register};
use herald_core::{DeliveryStatus, Error, InMemoryDirectory, InboundEvent, TrustDecision};
use std::sync::Arc;

#[test]
fn direct_message_round_trips() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    let report = alice.pipeline.send_message("+15550101", "hello bob").unwrap();
    assert!(report.all_sent());
    pump(&[&alice, &bob]);

    let events = drain_events(&bob);
    match events.as_slice() {
        [InboundEvent::Message { sender, text, .. }] => {
            assert_eq!(sender.peer, "+15550100");
            assert_eq!(text, "hello bob");
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn conversation_survives_many_turns_and_sizes() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    for round in 0..5u32 {
        let text = "x".repeat(round as usize * 500);
        alice.pipeline.send_message("+15550101", &text).unwrap();
        pump(&[&alice, &bob]);
        let events = drain_events(&bob);
        assert_eq!(events.len(), 1, "round {}", round);

        bob.pipeline
            .send_message("+15550100", &format!("ack {}", round))
            .unwrap();
        pump(&[&alice, &bob]);
        let events = drain_events(&alice);
        match &events[..] {
            [InboundEvent::Message { text, .. }] => {
                assert_eq!(text, &format!("ack {}", round));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }
}

#[test]
fn replayed_frame_is_rejected_not_redecrypted() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    alice.pipeline.send_message("+15550101", "once only").unwrap();
    let envelopes = alice.transport.take_delivered();
    assert_eq!(envelopes.len(), 1);

    bob.pipeline.receive(&envelopes[0]).unwrap();
    assert_eq!(drain_events(&bob).len(), 1);

    // the same envelope again: deduplicated, no event
    bob.pipeline.receive(&envelopes[0]).unwrap();
    assert!(drain_events(&bob).is_empty());

    // the same ciphertext under a fresh envelope id: the ratchet refuses
    let mut replay = envelopes[0].clone();
    replay.id = "forged-redelivery".to_string();
    match bob.pipeline.receive(&replay) {
        Err(Error::Replay(0)) => {}
        other => panic!("expected replay rejection, got {:?}", other),
    }
    assert!(drain_events(&bob).is_empty());
}

#[test]
fn one_send_reaches_every_device_of_the_peer() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");
    let bob2 = link(&bob, &directory);
    assert_eq!(bob2.account.device_id(), 2);

    let report = alice.pipeline.send_message("+15550101", "to all").unwrap();
    assert_eq!(report.deliveries.len(), 2);
    assert!(report.all_sent());

    let envelopes = alice.transport.take_delivered();
    assert_eq!(envelopes.len(), 2);
    // independently encrypted: distinct ciphertext bodies
    assert_ne!(envelopes[0].frame.body, envelopes[1].frame.body);

    for envelope in &envelopes {
        let target = if envelope.recipient.device_id == 1 {
            &bob
        } else {
            &bob2
        };
        target.pipeline.receive(envelope).unwrap();
        let events = drain_events(target);
        assert!(matches!(&events[..], [InboundEvent::Message { .. }]));
    }
}

#[test]
fn exhausted_pre_key_pool_fails_establishment() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    // Drain bob's published pool the way the service would.
    while bob.account.identity_store().pre_key_count().unwrap() > 0 {
        bob.account.identity_store().publish_bundle().unwrap();
    }

    let report = alice.pipeline.send_message("+15550101", "anyone there?").unwrap();
    match &report.deliveries[0].status {
        DeliveryStatus::Failed { reason, retryable } => {
            assert!(!retryable);
            assert!(reason.contains("pre-key pool exhausted"), "reason: {}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // Replenishment recovers the path.
    bob.account
        .identity_store()
        .replenish_pre_keys(10, 10)
        .unwrap();
    let report = alice.pipeline.send_message("+15550101", "retry").unwrap();
    assert!(report.all_sent());
}

#[test]
fn identity_change_is_surfaced_and_clears_sessions() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    alice.pipeline.send_message("+15550101", "hi").unwrap();
    pump(&[&alice, &bob]);
    assert!(!alice
        .account
        .session_store()
        .sub_device_sessions("+15550101")
        .unwrap()
        .is_empty());

    // The peer reinstalled: their published identity no longer matches.
    let decision = alice
        .account
        .save_peer_identity("+15550101", [0xEE; 32])
        .unwrap();
    assert_eq!(decision, TrustDecision::Changed);
    assert!(alice
        .account
        .session_store()
        .sub_device_sessions("+15550101")
        .unwrap()
        .is_empty());

    // The next send trips over the mismatch and reports it distinctly.
    let report = alice.pipeline.send_message("+15550101", "still you?").unwrap();
    match &report.deliveries[0].status {
        DeliveryStatus::Failed { reason, .. } => {
            assert!(reason.contains("Identity key changed"), "reason: {}", reason);
        }
        other => panic!("expected trust failure, got {:?}", other),
    }
    assert!(matches!(
        drain_events(&alice).as_slice(),
        [InboundEvent::TrustChanged { .. }]
    ));

    // Once the change is acknowledged, messaging re-establishes.
    let report = alice.pipeline.send_message("+15550101", "ok then").unwrap();
    assert!(report.all_sent());
    pump(&[&alice, &bob]);
    let events = drain_events(&bob);
    assert!(matches!(&events[..], [InboundEvent::Message { text, .. }] if text == "ok then"));
}

#[test]
fn retryable_transport_failures_back_off_then_succeed() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let _bob = register(&directory, "+15550101");

    alice.transport.fail_retryable(2);
    let report = alice.pipeline.send_message("+15550101", "eventually").unwrap();
    match &report.deliveries[0].status {
        DeliveryStatus::Sent { attempts } => assert_eq!(*attempts, 3),
        other => panic!("expected success after retries, got {:?}", other),
    }
}

#[test]
fn retries_are_bounded_then_surfaced() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let _bob = register(&directory, "+15550101");

    alice.transport.fail_retryable(10);
    let report = alice.pipeline.send_message("+15550101", "never").unwrap();
    match &report.deliveries[0].status {
        DeliveryStatus::Failed { retryable, .. } => assert!(*retryable),
        other => panic!("expected bounded retry failure, got {:?}", other),
    }
}

#[test]
fn terminal_transport_failure_is_not_retried() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let _bob = register(&directory, "+15550101");

    alice.transport.fail_terminal(true);
    let report = alice.pipeline.send_message("+15550101", "gone").unwrap();
    match &report.deliveries[0].status {
        DeliveryStatus::Failed { retryable, reason } => {
            assert!(!retryable);
            assert!(reason.contains("unregistered"));
        }
        other => panic!("expected terminal failure, got {:?}", other),
    }
}

#[test]
fn batch_processing_tolerates_bad_envelopes() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    alice.pipeline.send_message("+15550101", "first").unwrap();
    alice.pipeline.send_typing("+15550101").unwrap();
    let mut envelopes = alice.transport.take_delivered();

    // corrupt the middle of the batch
    let mut bad = envelopes[0].clone();
    bad.id = "corrupted".to_string();
    bad.frame.body = "!!!not-base64!!!".to_string();
    envelopes.insert(1, bad);

    let summary = bob.pipeline.receive_batch(&envelopes, None);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);

    let events = drain_events(&bob);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], InboundEvent::Message { .. }));
    assert!(matches!(events[1], InboundEvent::Typing { .. }));
}

#[test]
fn receive_batch_honors_max_messages() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    for i in 0..4 {
        alice
            .pipeline
            .send_message("+15550101", &format!("m{}", i))
            .unwrap();
    }
    let envelopes = alice.transport.take_delivered();
    let summary = bob.pipeline.receive_batch(&envelopes, Some(2));
    assert_eq!(summary.processed, 2);
    assert_eq!(drain_events(&bob).len(), 2);
}

#[test]
fn unsealed_envelopes_route_by_outer_sender() {
    let directory = Arc::new(InMemoryDirectory::new());
    let mut config = common::test_config();
    config.sealed_sender = false;

    // rebuild alice with unsealed framing
    let alice = register(&directory, "+15550100");
    let (pipeline, _events) = herald_core::MessagePipeline::new(
        alice.account.clone(),
        Arc::new(herald_core::ChainKdfEngine::new()),
        alice.transport.clone(),
        directory.clone(),
        config,
    );
    let bob = register(&directory, "+15550101");

    pipeline.send_message("+15550101", "visible sender").unwrap();
    let envelopes = alice.transport.take_delivered();
    assert!(!envelopes[0].sealed);
    assert_eq!(envelopes[0].sender.as_ref().unwrap().peer, "+15550100");

    bob.pipeline.receive(&envelopes[0]).unwrap();
    assert_eq!(drain_events(&bob).len(), 1);
}

#[test]
fn sealed_envelopes_hide_the_sender_on_the_wire() {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = register(&directory, "+15550100");
    let bob = register(&directory, "+15550101");

    // first message carries establishment data; settle the session first
    alice.pipeline.send_message("+15550101", "settle").unwrap();
    pump(&[&alice, &bob]);
    bob.pipeline.send_message("+15550100", "settled").unwrap();
    pump(&[&alice, &bob]);
    drain_events(&alice);
    drain_events(&bob);

    alice.pipeline.send_message("+15550101", "whisper").unwrap();
    let envelopes = alice.transport.take_delivered();
    assert!(envelopes[0].sealed);
    assert!(envelopes[0].sender.is_none());
    assert!(envelopes[0].frame.header.session_init.is_none());

    // the receiver still resolves the sender by trial decryption
    bob.pipeline.receive(&envelopes[0]).unwrap();
    let events = drain_events(&bob);
    match &events[..] {
        [InboundEvent::Message { sender, text, .. }] => {
            assert_eq!(sender.peer, "+15550100");
            assert_eq!(text, "whisper");
        }
        other => panic!("unexpected events: {:?}", other),
    }
}
