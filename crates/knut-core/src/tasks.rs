// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome visible through the query tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Done(Result<String, String>),
    Unknown,
}

struct TaskEntry {
    cancel: CancellationToken,
    result: Arc<Mutex<Option<Result<String, String>>>>,
    done: Arc<tokio::sync::Notify>,
}

/// Registry of background sub-tasks (sub-agents, long commands).
///
/// Each task has its own cancellation token, independent of the turn's:
/// background work survives turn cancellation and stops on explicit stop
/// or process shutdown.
pub struct BackgroundTasks {
    next: AtomicU64,
    map: Mutex<HashMap<String, TaskEntry>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a task; returns its id.  `make` receives the task's own
    /// cancellation token.
    pub fn spawn<F, Fut>(&self, make: F) -> String
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let id = format!("task_{}", self.next.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        let result = Arc::new(Mutex::new(None));
        let done = Arc::new(tokio::sync::Notify::new());

        let fut = make(cancel.clone());
        {
            let result = Arc::clone(&result);
            let done = Arc::clone(&done);
            let cancel = cancel.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err("cancelled".to_string()),
                    outcome = fut => outcome,
                };
                debug!(%id, ok = outcome.is_ok(), "background task finished");
                *result.lock().unwrap() = Some(outcome);
                done.notify_waiters();
            });
        }

        self.map.lock().unwrap().insert(
            id.clone(),
            TaskEntry {
                cancel,
                result,
                done,
            },
        );
        id
    }

    pub fn status(&self, id: &str) -> TaskStatus {
        let map = self.map.lock().unwrap();
        match map.get(id) {
            Some(entry) => match entry.result.lock().unwrap().clone() {
                Some(outcome) => TaskStatus::Done(outcome),
                None => TaskStatus::Running,
            },
            None => TaskStatus::Unknown,
        }
    }

    /// Request cancellation.  Returns false for unknown ids.
    pub fn stop(&self, id: &str) -> bool {
        match self.map.lock().unwrap().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for completion and return the outcome.
    pub async fn wait(&self, id: &str) -> Option<Result<String, String>> {
        let (result, done) = {
            let map = self.map.lock().unwrap();
            let entry = map.get(id)?;
            (Arc::clone(&entry.result), Arc::clone(&entry.done))
        };
        loop {
            // Register interest before re-checking to avoid a lost wakeup.
            let notified = done.notified();
            if let Some(outcome) = result.lock().unwrap().clone() {
                return Some(outcome);
            }
            notified.await;
        }
    }

    /// Cancel everything; called at process shutdown.
    pub fn shutdown(&self) {
        for entry in self.map.lock().unwrap().values() {
            entry.cancel.cancel();
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
