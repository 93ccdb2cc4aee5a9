// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::atomic::Ordering, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use dns_request_rs::{
    engine::{RequestError, RequestFlags, RequestParams, task::Task},
    message::{ParseOptions, TsigKey, wire},
};

use crate::unit_tests::mocks::{
    ConnectBehavior, MockManager, MockQuery, MockResponse, completion_channel, dest_v4,
    sample_query, sample_response, settle,
};

fn params() -> RequestParams {
    RequestParams::new(dest_v4()).timeout(Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn test_forced_tcp_connects_and_frames() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("tcp-forced");
    let (callback, mut rx) = completion_channel();

    let query = sample_query();
    let request = engine.create_raw(
        &query,
        &params().flags(RequestFlags::TCP | RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    let tcp = mgr.last_tcp();
    assert_eq!(tcp.socket.connects.load(Ordering::SeqCst), 1);
    assert!(tcp.started_tcp.load(Ordering::SeqCst));

    // The frame is the big-endian length followed by the wire message.
    let sends = tcp.socket.sent_payloads();
    assert_eq!(sends.len(), 1);
    let mut expected = vec![0x00, 0x1c];
    expected.extend_from_slice(&query);
    assert_eq!(&sends[0][..], &expected[..]);
    // Connected socket: no per-send destination.
    assert!(tcp.socket.sends.lock()[0].dest.is_none());

    assert!(tcp.deliver(0x1234, &sample_response(0x1234, 80)));
    let result = rx.recv().await.expect("completion");
    assert!(result.is_ok());
    assert!(request.used_tcp());
    assert_eq!(request.answer().map(|a| a.len()), Some(80));

    // UDP default stayed untouched.
    assert!(mgr.udp.socket.sends.lock().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_large_raw_query_uses_tcp() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("tcp-large");
    let (callback, mut rx) = completion_channel();

    let mut query = vec![0u8; 600];
    wire::set_message_id(&mut query, 0x2222);

    let request = engine.create_raw(
        &query,
        &params().flags(RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    let tcp = mgr.last_tcp();
    let sends = tcp.socket.sent_payloads();
    assert_eq!(sends.len(), 1);
    assert_eq!(&sends[0][..2], &[0x02, 0x58]);
    assert_eq!(sends[0].len(), 602);

    assert!(tcp.deliver(0x2222, &sample_response(0x2222, 40)));
    assert!(rx.recv().await.expect("completion").is_ok());
    assert!(request.used_tcp());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_via_promotes_oversized_message_to_tcp() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("tcp-promote");
    let (callback, mut rx) = completion_channel();

    let mut message = MockQuery::sized(900);
    message.tsig = Some(Bytes::from_static(b"query-tsig"));
    let key = TsigKey::new("key.example.", "hmac-sha256", b"secret".to_vec());

    let request =
        engine.create_via(&mut message, Some(&key), &params(), &task, callback)?;

    settle().await;
    // Rendered once for UDP, reset, re-rendered for TCP; the key was
    // attached only the first time around.
    assert_eq!(message.renders, 2);
    assert_eq!(message.resets, 1);
    assert_eq!(message.key_sets, 1);
    // The UDP slot from the first attempt is gone.
    assert!(mgr.udp.slot_ids().is_empty());

    let tcp = mgr.last_tcp();
    let id = message.id;
    let sends = tcp.socket.sent_payloads();
    assert_eq!(sends.len(), 1);
    assert_eq!(&sends[0][..2], &[0x03, 0x84]);
    assert_eq!(sends[0].len(), 902);
    assert_eq!(wire::message_id(&sends[0][2..]), Some(id));

    assert!(tcp.deliver(id, &sample_response(id, 120)));
    assert!(rx.recv().await.expect("completion").is_ok());
    assert!(request.used_tcp());

    // TSIG state replays into the parsed response and gets verified.
    let mut response = MockResponse::default();
    request.get_response(&mut response, ParseOptions::default())?;
    assert_eq!(response.query_tsig, Some(Bytes::from_static(b"query-tsig")));
    assert_eq!(response.key.as_ref().map(|k| k.name()), Some("key.example."));
    assert!(response.verified);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fixed_id_collision_retries_once_with_new_tcp() -> Result<()> {
    let mgr = MockManager::new();
    mgr.tcp_reject_once.lock().insert(0x1234);
    let engine = mgr.engine();
    let task = Task::spawn("tcp-collision");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::TCP | RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    // The colliding dispatch was abandoned for a fresh one.
    assert_eq!(mgr.tcp_created.lock().len(), 2);
    let tcp = mgr.last_tcp();
    assert!(tcp.has_slot(0x1234));

    settle().await;
    assert!(tcp.deliver(0x1234, &sample_response(0x1234, 33)));
    assert!(rx.recv().await.expect("completion").is_ok());
    drop(request);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_share_reuses_connected_dispatch() -> Result<()> {
    let mgr = MockManager::new();
    let shared = crate::unit_tests::mocks::MockDispatch::tcp();
    *mgr.shared_tcp.lock() = Some((shared.clone(), true));
    let engine = mgr.engine();
    let task = Task::spawn("tcp-share");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::TCP | RequestFlags::SHARE | RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    // Already connected: straight to a framed send, no connect.
    assert_eq!(shared.socket.connects.load(Ordering::SeqCst), 0);
    assert_eq!(shared.socket.sent_payloads().len(), 1);
    assert!(mgr.tcp_created.lock().is_empty());

    assert!(shared.deliver(0x1234, &sample_response(0x1234, 25)));
    assert!(rx.recv().await.expect("completion").is_ok());
    drop(request);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_share_pending_defers_send_until_connected() -> Result<()> {
    let mgr = MockManager::new();
    let shared = crate::unit_tests::mocks::MockDispatch::tcp();
    shared.socket.set_connect_behavior(ConnectBehavior::Pending);
    *mgr.shared_tcp.lock() = Some((shared.clone(), false));
    let engine = mgr.engine();
    let task = Task::spawn("tcp-pending");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::TCP | RequestFlags::SHARE | RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    // Joined the pending connect: nothing on the wire yet.
    assert_eq!(shared.socket.connects.load(Ordering::SeqCst), 1);
    assert!(shared.socket.sent_payloads().is_empty());

    shared.socket.complete_connect(Ok(()));
    settle().await;
    assert_eq!(shared.socket.sent_payloads().len(), 1);

    assert!(shared.deliver(0x1234, &sample_response(0x1234, 25)));
    assert!(rx.recv().await.expect("completion").is_ok());
    assert!(request.used_tcp());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_cancels() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("tcp-refused");
    let (callback, mut rx) = completion_channel();

    // The dispatch is created by the engine; script its socket as soon as
    // it exists by pre-seeding via shared_tcp instead.
    let shared = crate::unit_tests::mocks::MockDispatch::tcp();
    shared.socket.set_connect_behavior(ConnectBehavior::Fail);
    *mgr.shared_tcp.lock() = Some((shared.clone(), false));

    let _request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::TCP | RequestFlags::SHARE),
        &task,
        callback,
    )?;

    let result = rx.recv().await.expect("completion");
    assert!(matches!(result, Err(RequestError::Canceled)));
    assert!(shared.socket.sent_payloads().is_empty());
    Ok(())
}
