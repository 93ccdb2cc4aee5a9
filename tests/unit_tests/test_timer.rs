// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use dns_request_rs::engine::{
    task::Task,
    timer::{TimerEvent, TimerHandle, TimerKind},
};
use tokio::{sync::mpsc, time::Instant};

fn timer_channel(task: &Task) -> (TimerHandle, mpsc::UnboundedReceiver<TimerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let timer = TimerHandle::new(task.clone(), move |event| {
        let _ = tx.send(event);
    });
    (timer, rx)
}

#[tokio::test(start_paused = true)]
async fn test_once_fires_at_expiry() -> Result<()> {
    let task = Task::spawn("timer-once");
    let (timer, mut rx) = timer_channel(&task);
    let start = Instant::now();

    timer.reset(TimerKind::Once {
        expiry: start + Duration::from_secs(1),
    });

    assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(start.elapsed() < Duration::from_millis(1100));

    // Spent: nothing further.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_limited_ticks_until_expiry() -> Result<()> {
    let task = Task::spawn("timer-limited");
    let (timer, mut rx) = timer_channel(&task);
    let start = Instant::now();

    timer.reset(TimerKind::Limited {
        expiry: start + Duration::from_secs(1),
        interval: Duration::from_millis(300),
    });

    assert_eq!(rx.recv().await, Some(TimerEvent::Tick));
    assert_eq!(rx.recv().await, Some(TimerEvent::Tick));
    assert_eq!(rx.recv().await, Some(TimerEvent::Tick));
    assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(start.elapsed() < Duration::from_millis(1100));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_detach_stops_the_timer() -> Result<()> {
    let task = Task::spawn("timer-detach");
    let (timer, mut rx) = timer_channel(&task);

    timer.reset(TimerKind::Once {
        expiry: Instant::now() + Duration::from_millis(500),
    });
    timer.detach();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reset_replaces_the_schedule() -> Result<()> {
    let task = Task::spawn("timer-reset");
    let (timer, mut rx) = timer_channel(&task);
    let start = Instant::now();

    timer.reset(TimerKind::Once {
        expiry: start + Duration::from_secs(10),
    });
    timer.reset(TimerKind::Once {
        expiry: start + Duration::from_secs(1),
    });

    assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(start.elapsed() < Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}
