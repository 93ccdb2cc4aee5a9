// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::engine::task::Task;

/// What a timer firing means to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// An intermediate interval tick (limited timers only).
    Tick,
    /// The deadline was reached. Terminal; the timer is spent.
    Expired,
}

/// How the timer should run after a [`TimerHandle::reset`].
#[derive(Debug, Clone, Copy)]
pub enum TimerKind {
    /// Fire `Expired` once at `expiry`.
    Once { expiry: Instant },
    /// Fire `Tick` every `interval` until `expiry`, then fire `Expired`.
    Limited { expiry: Instant, interval: Duration },
}

/// A cancellable one-shot or limited-periodic timer.
///
/// Events are posted to the owning [`Task`], never invoked inline, so the
/// handler runs serialized with every other event of the same request.
/// `reset` replaces any armed schedule; `detach` stops the timer for good.
pub struct TimerHandle {
    task: Task,
    handler: Arc<dyn Fn(TimerEvent) + Send + Sync>,
    armed: Mutex<Option<CancellationToken>>,
}

impl TimerHandle {
    /// Create an inactive timer. Nothing fires until [`TimerHandle::reset`].
    pub fn new(task: Task, handler: impl Fn(TimerEvent) + Send + Sync + 'static) -> Self {
        Self {
            task,
            handler: Arc::new(handler),
            armed: Mutex::new(None),
        }
    }

    /// Arm (or re-arm) the timer. A previously armed schedule is cancelled;
    /// events it already posted may still be delivered and must be absorbed
    /// by the handler.
    pub fn reset(&self, kind: TimerKind) {
        let token = CancellationToken::new();
        if let Some(old) = self.armed.lock().replace(token.clone()) {
            old.cancel();
        }

        let task = self.task.clone();
        let handler = self.handler.clone();
        tokio::spawn(async move {
            match kind {
                TimerKind::Once { expiry } => {
                    tokio::select! {
                        _ = token.cancelled() => {},
                        _ = sleep_until(expiry) => {
                            post(&task, &handler, TimerEvent::Expired);
                        },
                    }
                },
                TimerKind::Limited { expiry, interval } => {
                    let mut next = Instant::now() + interval;
                    loop {
                        let (when, event) = if next >= expiry {
                            (expiry, TimerEvent::Expired)
                        } else {
                            (next, TimerEvent::Tick)
                        };
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = sleep_until(when) => {},
                        }
                        post(&task, &handler, event);
                        if event == TimerEvent::Expired {
                            return;
                        }
                        next += interval;
                    }
                },
            }
        });
    }

    /// Stop the timer. No new events will be posted.
    pub fn detach(&self) {
        if let Some(token) = self.armed.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

fn post(task: &Task, handler: &Arc<dyn Fn(TimerEvent) + Send + Sync>, event: TimerEvent) {
    let handler = handler.clone();
    task.send(move || handler(event));
}
