// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;
use tracing::debug;

type TaskEvent = Box<dyn FnOnce() + Send + 'static>;

/// A serialized event queue bound to one caller.
///
/// Every callback that touches a given request — completion, cancellation
/// control, timer ticks, socket completions, response delivery — is posted
/// to the request's `Task`, so the caller never observes two of them running
/// at once and never observes reentrancy from inside its own handler.
///
/// Cloning a `Task` is cheap and keeps the worker alive; the worker exits
/// once every clone is gone and the queue drains. Requires an ambient tokio
/// runtime.
#[derive(Clone)]
pub struct Task {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl Task {
    pub fn spawn(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
        let task_name: Arc<str> = Arc::from(name);

        let worker_name = task_name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                event();
            }
            debug!("task {worker_name}: queue closed, worker exiting");
        });

        Self {
            name: task_name,
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an event. Never blocks. Events posted after the runtime shut
    /// down are silently dropped.
    pub fn send(&self, event: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(event));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}
