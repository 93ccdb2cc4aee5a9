// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use dns_request_rs::{
    acl::NetPrefixList,
    engine::{RequestError, RequestFlags, RequestParams, task::Task},
    message::{ParseOptions, wire},
};
use tokio::time::Instant;

use crate::unit_tests::mocks::{
    MockManager, MockResponse, completion_channel, dest_v4, sample_query,
    sample_response, settle,
};

fn params() -> RequestParams {
    RequestParams::new(dest_v4()).timeout(Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn test_udp_happy_path() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-happy");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    assert!(mgr.udp.deliver(0x1234, &sample_response(0x1234, 45)));

    let result = rx.recv().await.expect("completion");
    assert!(result.is_ok());
    assert_eq!(request.answer().map(|a| a.len()), Some(45));
    assert!(!request.used_tcp());

    // The query went out unframed, exactly as handed in.
    let sends = mgr.udp.socket.sent_payloads();
    assert_eq!(sends.len(), 1);
    assert_eq!(&sends[0][..], &sample_query()[..]);

    // Exactly one completion.
    settle().await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_assigns_id_without_fixed_id() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-id");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(&sample_query(), &params(), &task, callback)?;
    settle().await;

    // The dispatch-assigned id was stamped over the caller's 0x1234.
    let ids = mgr.udp.slot_ids();
    assert_eq!(ids.len(), 1);
    let id = ids[0];
    assert_ne!(id, 0x1234);
    let sends = mgr.udp.socket.sent_payloads();
    assert_eq!(wire::message_id(&sends[0]), Some(id));

    assert!(mgr.udp.deliver(id, &sample_response(id, 64)));
    assert!(rx.recv().await.expect("completion").is_ok());
    assert_eq!(request.answer().map(|a| a.len()), Some(64));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-timeout");
    let (callback, mut rx) = completion_channel();
    let start = Instant::now();

    let request = engine.create_raw(&sample_query(), &params(), &task, callback)?;

    let result = rx.recv().await.expect("completion");
    assert!(matches!(result, Err(RequestError::TimedOut)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_millis(5200));
    assert!(request.answer().is_none());

    settle().await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_udp_retransmissions() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-retry");
    let (callback, mut rx) = completion_channel();
    let start = Instant::now();

    let request = engine.create_raw(
        &sample_query(),
        &RequestParams::new(dest_v4())
            .timeout(Duration::from_secs(1))
            .udp_retries(3),
        &task,
        callback,
    )?;

    let result = rx.recv().await.expect("completion");
    assert!(matches!(result, Err(RequestError::TimedOut)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1200));

    // retries + 1 sends, spaced by timeout / (retries + 1).
    let times = mgr.udp.socket.send_times();
    assert_eq!(times.len(), 4);
    let offsets: Vec<Duration> = times.iter().map(|at| *at - start).collect();
    let expected = [0u64, 250, 500, 750];
    for (offset, expected_ms) in offsets.iter().zip(expected) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            *offset >= expected && *offset < expected + Duration::from_millis(50),
            "send at {offset:?}, expected ≈{expected:?}"
        );
    }

    drop(request);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_times_out_on_next_tick() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-exhaust");
    let (callback, mut rx) = completion_channel();
    let start = Instant::now();

    // One retry with a short explicit period: the second tick finds the
    // counter exhausted and times the request out well before the overall
    // deadline.
    let _request = engine.create_raw(
        &sample_query(),
        &RequestParams::new(dest_v4())
            .timeout(Duration::from_secs(5))
            .udp_retries(1)
            .udp_timeout(Duration::from_millis(100)),
        &task,
        callback,
    )?;

    let result = rx.recv().await.expect("completion");
    assert!(matches!(result, Err(RequestError::TimedOut)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400));
    assert_eq!(mgr.udp.socket.sends.lock().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_blackholed_destination() -> Result<()> {
    let mgr = MockManager::new();
    *mgr.blackhole.lock() = Some(std::sync::Arc::new(NetPrefixList::parse(&[
        "127.0.0.0/8".to_string(),
    ])?));
    let engine = mgr.engine();
    let task = Task::spawn("udp-blackhole");
    let (callback, _rx) = completion_channel();

    let err = engine
        .create_raw(&sample_query(), &params(), &task, callback)
        .expect_err("blackholed");
    assert!(matches!(err, RequestError::Blackholed));

    // Refused before any socket or dispatch activity.
    settle().await;
    assert!(mgr.udp.socket.sends.lock().is_empty());
    assert!(mgr.udp.slot_ids().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_form_err_bounds() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-formerr");

    let (callback, _rx) = completion_channel();
    let err = engine
        .create_raw(&[0u8; 11], &params(), &task, callback)
        .expect_err("short buffer");
    assert!(matches!(err, RequestError::FormErr));

    let (callback, _rx) = completion_channel();
    let err = engine
        .create_raw(&vec![0u8; 65536], &params(), &task, callback)
        .expect_err("oversized buffer");
    assert!(matches!(err, RequestError::FormErr));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_family_checks() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-family");

    let (callback, _rx) = completion_channel();
    let err = engine
        .create_raw(
            &sample_query(),
            &params().source("[::1]:0".parse()?),
            &task,
            callback,
        )
        .expect_err("family mismatch");
    assert!(matches!(err, RequestError::FamilyMismatch));

    // No default v6 dispatch and no source address.
    let (callback, _rx) = completion_channel();
    let err = engine
        .create_raw(
            &sample_query(),
            &RequestParams::new("[::1]:53000".parse()?).timeout(Duration::from_secs(5)),
            &task,
            callback,
        )
        .expect_err("no v6 dispatch");
    assert!(matches!(err, RequestError::FamilyNotSupported));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_response_waits_for_send_completion() -> Result<()> {
    // A response that lands while the send is still in flight must not
    // complete the request until the send does.
    let mgr = MockManager::new();
    mgr.udp.socket.hold_sends();
    let engine = mgr.engine();
    let task = Task::spawn("udp-gate");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    settle().await;
    assert!(mgr.udp.deliver(0x1234, &sample_response(0x1234, 30)));
    settle().await;
    assert!(rx.try_recv().is_err(), "completion before send finished");

    mgr.udp.socket.complete_sends();
    let result = rx.recv().await.expect("completion");
    assert!(result.is_ok());
    assert_eq!(request.answer().map(|a| a.len()), Some(30));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_cancels() -> Result<()> {
    let mgr = MockManager::new();
    mgr.udp.socket.fail_sends();
    let engine = mgr.engine();
    let task = Task::spawn("udp-sendfail");
    let (callback, mut rx) = completion_channel();

    let _request = engine.create_raw(&sample_query(), &params(), &task, callback)?;
    let result = rx.recv().await.expect("completion");
    assert!(matches!(result, Err(RequestError::Canceled)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_get_response_parses_answer() -> Result<()> {
    let mgr = MockManager::new();
    let engine = mgr.engine();
    let task = Task::spawn("udp-parse");
    let (callback, mut rx) = completion_channel();

    let request = engine.create_raw(
        &sample_query(),
        &params().flags(RequestFlags::FIXED_ID),
        &task,
        callback,
    )?;

    let mut message = MockResponse::default();
    assert!(matches!(
        request.get_response(&mut message, ParseOptions::default()),
        Err(RequestError::NotReady)
    ));

    settle().await;
    assert!(mgr.udp.deliver(0x1234, &sample_response(0x1234, 45)));
    rx.recv().await.expect("completion").expect("success");

    let mut message = MockResponse::default();
    request.get_response(&mut message, ParseOptions::default())?;
    assert_eq!(message.parsed.map(|p| p.len()), Some(45));
    // No key attached: no verification.
    assert!(!message.verified);
    assert!(message.key.is_none());
    Ok(())
}
