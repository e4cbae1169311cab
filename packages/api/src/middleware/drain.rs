// ABOUTME: Connection tracking and drain gating for graceful shutdown
// ABOUTME: Rejects new work while draining and signals once the last in-flight request finishes

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::AppError;

/// Probe paths served even while draining.
pub const PROBE_PATHS: &[&str] = &["/healthz", "/readyz", "/health"];

#[derive(Debug, Default, Clone, Copy)]
struct DrainState {
    draining: bool,
    active: usize,
}

struct DrainInner {
    state: Mutex<DrainState>,
    drained: watch::Sender<bool>,
}

/// Shared drain state for one server instance.
#[derive(Clone)]
pub struct DrainController {
    inner: Arc<DrainInner>,
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainController {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            inner: Arc::new(DrainInner {
                state: Mutex::new(DrainState::default()),
                drained,
            }),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut DrainState) -> T) -> T {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut state);
        if state.draining && state.active == 0 {
            // Fires at most once; later calls see it already set.
            self.inner.drained.send_if_modified(|done| {
                let fire = !*done;
                *done = true;
                fire
            });
        }
        out
    }

    /// Count one in-flight connection until the guard drops.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.update(|state| state.active += 1);
        ConnectionGuard {
            controller: self.clone(),
        }
    }

    /// Count a new connection unless draining has begun, checked under the same lock.
    pub fn try_track_connection(&self) -> Option<ConnectionGuard> {
        let admitted = self.update(|state| {
            if state.draining {
                return false;
            }
            state.active += 1;
            true
        });
        admitted.then(|| ConnectionGuard {
            controller: self.clone(),
        })
    }

    /// Stop accepting new work.
    pub fn begin_drain(&self) {
        let active = self.update(|state| {
            state.draining = true;
            state.active
        });
        info!(active_connections = active, "Drain started");
    }

    pub fn is_draining(&self) -> bool {
        self.update(|state| state.draining)
    }

    pub fn active_connections(&self) -> usize {
        self.update(|state| state.active)
    }

    /// Resolve once draining has begun and no connection remains.
    pub async fn await_drained(&self) {
        let mut rx = self.inner.drained.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Releases its connection slot on drop.
pub struct ConnectionGuard {
    controller: DrainController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller
            .update(|state| state.active = state.active.saturating_sub(1));
    }
}

pub fn is_probe(path: &str) -> bool {
    PROBE_PATHS.contains(&path)
}

/// Outermost middleware: reject non-probe requests while draining, count the rest.
pub async fn drain_gate(
    State(drain): State<DrainController>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_probe(path) {
        return next.run(request).await;
    }
    let Some(_guard) = drain.try_track_connection() else {
        debug!(path = %path, "Request rejected while draining");
        return AppError::ServiceUnavailable.into_response();
    };
    next.run(request).await
}
