//! Health check HTTP server for container orchestration
//!
//! Serves broker liveness, readiness and a metrics export next to the agent
//! port. Readiness means the scheduler worker still answers requests.

use crate::observability::metrics::metrics;
use crate::scheduler::{BrokerStats, SchedulerHandle, SessionInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

const SCHEDULER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP health check server
pub struct HealthServer {
    broker_addr: String,
    port: u16,
    scheduler: SchedulerHandle,
}

impl HealthServer {
    pub fn new(broker_addr: impl Into<String>, port: u16, scheduler: SchedulerHandle) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            port,
            scheduler,
        }
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!(port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let sessions_server = self.clone();
        let ready_server = self;

        // GET /health - broker status with live counts
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /sessions - connected agents
        let sessions_route = warp::path("sessions").and(warp::get()).and_then(move || {
            let server = sessions_server.clone();
            async move {
                let sessions =
                    tokio::time::timeout(SCHEDULER_PROBE_TIMEOUT, server.scheduler.sessions()).await;
                let reply = match sessions {
                    Ok(Ok(sessions)) => warp::reply::with_status(
                        warp::reply::json(&SessionsResponse {
                            count: sessions.len(),
                            sessions,
                        }),
                        StatusCode::OK,
                    ),
                    _ => warp::reply::with_status(
                        warp::reply::json(&SessionsResponse {
                            count: 0,
                            sessions: Vec::new(),
                        }),
                        StatusCode::SERVICE_UNAVAILABLE,
                    ),
                };
                Ok::<_, Infallible>(reply)
            }
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.probe_scheduler().await.is_some();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints: HashMap<&'static str, &'static str> = HashMap::from([
                ("/health", "Broker status with session and directory counts"),
                ("/metrics", "Session, routing and directory metrics"),
                ("/sessions", "Connected agents and when they connected"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]);
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        health_route
            .or(metrics_route)
            .or(sessions_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    async fn probe_scheduler(&self) -> Option<BrokerStats> {
        match tokio::time::timeout(SCHEDULER_PROBE_TIMEOUT, self.scheduler.stats()).await {
            Ok(Ok(stats)) => Some(stats),
            _ => None,
        }
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let stats = self.probe_scheduler().await;

        let scheduler_check = match &stats {
            Some(_) => HealthCheck {
                status: "healthy".to_string(),
                message: Some("Scheduler is processing commands".to_string()),
                last_check: now,
            },
            None => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("Scheduler stopped or not responding".to_string()),
                last_check: now,
            },
        };

        let mut checks = HashMap::new();
        checks.insert("scheduler".to_string(), scheduler_check);

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if overall_healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: now,
            broker: self.broker_addr.clone(),
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            stats,
            checks,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    broker: String,
    uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<BrokerStats>,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    count: usize,
    sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
