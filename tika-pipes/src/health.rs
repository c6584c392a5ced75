//! Health reporting for components of the service.
//!
//! The worker pool and registry sweeper run as independent background
//! tasks; the process can only be trusted to serve requests if those loops
//! are actually alive. `HealthRegistry` lets an arbitrary number of
//! components report their status and folds them into one process-level
//! verdict. Uses `std::time::Instant` rather than a wall-clock type since
//! deadlines here are only ever compared against each other, never
//! serialized or displayed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::SERVICE_UNAVAILABLE, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(Instant),
    Unhealthy,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
            .await;
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {err}");
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("poisoned HealthRegistry mutex"),
                }
            }
        });

        registry
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_string(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// All registered components must be currently healthy for the process
    /// to be considered healthy; an empty registry is not healthy.
    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read().expect("poisoned HealthRegistry mutex");
        let now = Instant::now();
        let mut healthy = !components.is_empty();
        let mut reported = HashMap::new();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    reported.insert(name.clone(), status.clone());
                }
                _ => {
                    healthy = false;
                    reported.insert(name.clone(), ComponentStatus::Unhealthy);
                }
            }
        }

        HealthStatus {
            healthy,
            components: reported,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
