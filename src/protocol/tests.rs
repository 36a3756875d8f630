// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ProtocolVersion, SuppressedPacket};
use crate::core::packet::{FrameKind, PacketHeader, MARKER_C1};
use crate::error::ProtocolError;
use crate::protocol::dispatcher::*;
use crate::protocol::handlers::test_support::RecordingContext;
use crate::protocol::state::ConnectionState;
use crate::utils::metrics::Metrics;

fn counting_entry(code: u8, sub_code: Option<u8>, counter: &Arc<AtomicUsize>) -> HandlerEntry {
    let counter = Arc::clone(counter);
    HandlerEntry::new(code, sub_code, "counting", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn header(code: u8, sub_code: Option<u8>) -> PacketHeader {
    PacketHeader {
        marker: MARKER_C1,
        kind: FrameKind::Short,
        length: 4,
        code,
        sub_code,
    }
}

fn gameplay_router(entries: Vec<HandlerEntry>) -> PacketRouter {
    let router = PacketRouter::with_tables(
        HandlerTable::default(),
        HandlerTable::from_entries(entries).unwrap(),
        Arc::new(Metrics::new()),
    );
    router.set_routing_mode(RoutingMode::Gameplay);
    router
}

#[test]
fn test_specific_then_fallback_then_unhandled() {
    let specific = Arc::new(AtomicUsize::new(0));
    let fallback = Arc::new(AtomicUsize::new(0));
    let router = gameplay_router(vec![
        counting_entry(0x0B, Some(0x20), &specific),
        counting_entry(0x0B, None, &fallback),
    ]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);
    let data = [0xC1, 0x04, 0x0B, 0x20];

    let outcome = router.dispatch(&ctx, &InboundPacket { header: header(0x0B, Some(0x20)), data: &data });
    assert_eq!(outcome, DispatchOutcome::Handled(HandlerKey::new(0x0B, 0x20)));
    assert_eq!(specific.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.load(Ordering::SeqCst), 0);

    let outcome = router.dispatch(&ctx, &InboundPacket { header: header(0x0B, Some(0x99)), data: &data });
    assert_eq!(outcome, DispatchOutcome::Handled(HandlerKey::main(0x0B)));
    assert_eq!(specific.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.load(Ordering::SeqCst), 1);

    let outcome = router.dispatch(&ctx, &InboundPacket { header: header(0x0C, Some(0x00)), data: &data });
    assert_eq!(outcome, DispatchOutcome::Unhandled);
    assert_eq!(specific.load(Ordering::SeqCst) + fallback.load(Ordering::SeqCst), 2);
}

#[test]
fn test_fallback_not_used_without_sub_code() {
    let specific = Arc::new(AtomicUsize::new(0));
    let router = gameplay_router(vec![counting_entry(0x0B, Some(0x20), &specific)]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);
    let data = [0xC1, 0x03, 0x0B];

    let outcome = router.dispatch(&ctx, &InboundPacket { header: header(0x0B, None), data: &data });
    assert_eq!(outcome, DispatchOutcome::Unhandled);
    assert_eq!(specific.load(Ordering::SeqCst), 0);
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let counter = Arc::new(AtomicUsize::new(0));
    let result = HandlerTable::from_entries(vec![
        counting_entry(0xF1, Some(0x01), &counter),
        counting_entry(0xF1, Some(0x01), &counter),
    ]);
    assert!(matches!(
        result,
        Err(ProtocolError::DuplicateHandler { code: 0xF1, sub_code: 0x01 })
    ));
}

#[test]
fn test_handler_error_is_contained() {
    let router = gameplay_router(vec![HandlerEntry::new(0x30, None, "failing", |_, _| {
        Err(ProtocolError::MalformedPacket("boom".into()))
    })]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);

    let outcome = router.route(&ctx, &[0xC1, 0x03, 0x30]);
    assert_eq!(outcome, DispatchOutcome::Failed(HandlerKey::main(0x30)));
    // Standard handlers get no movement recovery
    assert!(!ctx.lock_released.load(Ordering::SeqCst));
}

#[test]
fn test_handler_panic_is_contained() {
    let router = gameplay_router(vec![HandlerEntry::new(0x31, None, "panicking", |_, _| {
        panic!("handler exploded")
    })]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);

    assert_eq!(
        router.route(&ctx, &[0xC1, 0x03, 0x31]),
        DispatchOutcome::Failed(HandlerKey::main(0x31))
    );
    // Router keeps working afterwards
    assert_eq!(router.route(&ctx, &[0xC1, 0x03, 0x32]), DispatchOutcome::Unhandled);
}

#[test]
fn test_failed_movement_handler_releases_lock() {
    let router = gameplay_router(vec![HandlerEntry::new(0xD4, None, "bad_walk", |_, packet| {
        packet.body_at_least(10).map(|_| ())
    })
    .movement()]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);

    assert_eq!(
        router.route(&ctx, &[0xC1, 0x04, 0xD4, 0x01]),
        DispatchOutcome::Failed(HandlerKey::main(0xD4))
    );
    assert!(ctx.lock_released.load(Ordering::SeqCst));
}

#[test]
fn test_suppressed_packets_skip_handlers() {
    let counter = Arc::new(AtomicUsize::new(0));
    let metrics = Arc::new(Metrics::new());
    let router = PacketRouter::with_tables(
        HandlerTable::default(),
        HandlerTable::from_entries(vec![counting_entry(0x11, None, &counter)]).unwrap(),
        Arc::clone(&metrics),
    )
    .with_suppressed(&[SuppressedPacket {
        mode: RoutingMode::Gameplay,
        code: 0x11,
        sub_code: None,
    }]);
    let (ctx, _queue) = RecordingContext::new(ConnectionState::InGame);

    // Relay mode: the suppression entry does not apply, and relay has no handler
    assert_eq!(router.route(&ctx, &[0xC1, 0x03, 0x11]), DispatchOutcome::Unhandled);

    router.set_routing_mode(RoutingMode::Gameplay);
    assert_eq!(router.route(&ctx, &[0xC1, 0x03, 0x11]), DispatchOutcome::Suppressed);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().suppressed_packets, 1);
}

#[test]
fn test_routing_mode_selects_sub_code_rules() {
    let router = PacketRouter::new(ProtocolVersion::Season6, Arc::new(Metrics::new())).unwrap();
    assert_eq!(router.routing_mode(), RoutingMode::Relay);

    let header = router.parse_header(&[0xC1, 0x04, 0xF1, 0x03]).unwrap();
    assert_eq!(header.sub_code, None);

    router.set_routing_mode(RoutingMode::Gameplay);
    let header = router.parse_header(&[0xC1, 0x04, 0xF1, 0x03]).unwrap();
    assert_eq!(header.code, 0xF1);
    assert_eq!(header.sub_code, Some(0x03));

    let header = router.parse_header(&[0xC1, 0x04, 0x05, 0x01]).unwrap();
    assert_eq!(header.code, 0x05);
    assert_eq!(header.sub_code, None);
}

#[test]
fn test_unparsable_packets_are_dropped() {
    let metrics = Arc::new(Metrics::new());
    let router = PacketRouter::new(ProtocolVersion::Season6, Arc::clone(&metrics)).unwrap();
    let (ctx, mut queue) = RecordingContext::new(ConnectionState::ConnectedToConnectServer);

    assert_eq!(router.route(&ctx, &[0xC1, 0x02]), DispatchOutcome::Unparsable);
    assert_eq!(router.route(&ctx, &[0x99, 0x04, 0x00, 0x01]), DispatchOutcome::Unparsable);
    assert_eq!(metrics.snapshot().unparsable_headers, 2);
    assert!(queue.drain().is_empty());
}

#[test]
fn test_builtin_relay_hello_routes() {
    let router = PacketRouter::new(ProtocolVersion::Season6, Arc::new(Metrics::new())).unwrap();
    let (ctx, _queue) = RecordingContext::new(ConnectionState::ConnectedToConnectServer);
    assert_eq!(
        router.route(&ctx, &[0xC1, 0x04, 0x00, 0x01]),
        DispatchOutcome::Handled(HandlerKey::new(0x00, 0x01))
    );
}
