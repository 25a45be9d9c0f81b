//! Admin API: snapshot lifecycle, recording control and introspection

use std::sync::Arc;

use chrono::Local;
use hyper::{Method, StatusCode};
use serde_json::json;
use tracing::warn;

use super::http::{
    create_response, error_response, json_response, query_param, text_response, HttpResponse,
};
use crate::app::App;
use crate::mapping::Mapping;
use crate::recording::RecordingState;

/// Router for the admin listener
pub struct AdminApi {
    app: Arc<App>,
}

impl AdminApi {
    /// Create the router
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// Dispatch one request
    pub async fn handle(&self, method: &Method, path: &str, query: Option<&str>) -> HttpResponse {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_segment)
            .collect();
        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (method.as_str(), parts.as_slice()) {
            ("POST", ["api", "snapshots"]) => self.create_snapshot(None).await,
            ("GET", ["api", "snapshots"]) => self.list_snapshots().await,
            ("POST", ["api", "snapshots", name]) => self.create_snapshot(Some(*name)).await,
            ("DELETE", ["api", "snapshots", name]) => self.delete_snapshot(name).await,
            ("POST", ["api", "snapshots", name, "restore"]) => self.restore_snapshot(name).await,
            ("GET", ["api", "snapshots", name, "exists"]) => self.snapshot_exists(name).await,

            ("POST", ["mock", "recording", "start"]) => {
                self.start_recording(query_param(query, "upstream")).await
            }
            ("POST", ["mock", "recording", "stop"]) => {
                self.stop_recording(query_param(query, "snapshotName")).await
            }
            ("GET", ["mock", "recording", "status"]) => {
                json_response(StatusCode::OK, &self.app.recorder.status().await)
            }
            ("POST", ["mock", "recording", "reset"]) => self.reset_mappings().await,

            ("GET", ["mock", "status"]) => self.engine_status().await,
            ("GET", ["mock", "list", "mappings"]) => self.list_mapping_urls().await,
            ("GET", ["mock", "mappings", rest @ ..]) if !rest.is_empty() => {
                self.mapping_by_path(&rest.join("/")).await
            }
            ("GET", ["mock", "files", rest @ ..]) if !rest.is_empty() => {
                self.file_by_path(&rest.join("/")).await
            }

            ("GET", ["health"]) => self.health().await,

            _ => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "error": format!("No route for {method} {path}") }),
            ),
        }
    }

    async fn create_snapshot(&self, name: Option<&str>) -> HttpResponse {
        let result = match name {
            Some(name) => self.app.snapshots.create(name).await,
            None => self.app.snapshots.create_auto().await,
        };

        match result {
            Ok(info) => json_response(
                StatusCode::OK,
                &json!({
                    "message": "Snapshot created successfully",
                    "name": info.name,
                    "timestamp": Local::now().to_rfc3339(),
                    "mappings": info.mappings,
                    "bodyFiles": info.body_files,
                    "sizeBytes": info.size_bytes,
                    "backend": info.backend,
                }),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn restore_snapshot(&self, name: &str) -> HttpResponse {
        match self.app.snapshots.restore(name).await {
            Ok(info) => json_response(
                StatusCode::OK,
                &json!({
                    "message": "Snapshot restored successfully",
                    "name": info.name,
                    "mappings": info.mappings,
                    "bodyFiles": info.body_files,
                }),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn list_snapshots(&self) -> HttpResponse {
        match self.app.snapshots.list().await {
            Ok(names) => json_response(StatusCode::OK, &names),
            Err(e) => error_response(&e),
        }
    }

    async fn delete_snapshot(&self, name: &str) -> HttpResponse {
        match self.app.snapshots.delete(name).await {
            Ok(true) => json_response(
                StatusCode::OK,
                &json!({ "message": "Snapshot deleted successfully", "name": name }),
            ),
            Ok(false) => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "error": format!("Snapshot not found: {name}") }),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn snapshot_exists(&self, name: &str) -> HttpResponse {
        match self.app.snapshots.exists(name).await {
            Ok(exists) => json_response(StatusCode::OK, &json!({ "exists": exists })),
            Err(e) => error_response(&e),
        }
    }

    async fn start_recording(&self, upstream: Option<String>) -> HttpResponse {
        match self.app.recorder.start(upstream).await {
            Ok(RecordingState::Recording { upstream, started_at }) => json_response(
                StatusCode::OK,
                &json!({
                    "status": "recording",
                    "proxyUrl": upstream,
                    "startedAt": started_at,
                    "message": "Recording started successfully",
                }),
            ),
            Ok(RecordingState::Idle) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "error": "Recording did not start" }),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn stop_recording(&self, snapshot_name: Option<String>) -> HttpResponse {
        let summary = match self.app.recorder.stop().await {
            Ok(summary) => summary,
            Err(e) => return error_response(&e),
        };

        let mut body = json!({
            "status": "stopped",
            "message": "Recording stopped successfully",
            "mappingsRecorded": summary.mappings_recorded,
            "mappingsTotal": summary.mappings_total,
        });

        if let Some(name) = snapshot_name.filter(|n| !n.is_empty()) {
            match self.app.snapshots.create(&name).await {
                Ok(info) => {
                    body["snapshot"] = json!(info.name);
                    body["message"] = json!(format!("Recording stopped. Snapshot created: {name}"));
                }
                Err(e) => return error_response(&e),
            }
        }

        json_response(StatusCode::OK, &body)
    }

    async fn reset_mappings(&self) -> HttpResponse {
        self.app.recorder.reset().await;
        json_response(
            StatusCode::OK,
            &json!({ "status": "success", "message": "All mappings have been reset" }),
        )
    }

    async fn engine_status(&self) -> HttpResponse {
        let status = self.app.store.status().await;
        text_response(
            StatusCode::OK,
            format!(
                "Mock server - Running: {}, Port: {}, Mappings: {}",
                status.running, status.port, status.mappings
            ),
        )
    }

    async fn list_mapping_urls(&self) -> HttpResponse {
        let urls: Vec<String> = self
            .app
            .store
            .list_mappings()
            .await
            .iter()
            .filter_map(request_url)
            .collect();
        json_response(StatusCode::OK, &urls)
    }

    fn logical_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.app.config.logical_path_prefix.trim_end_matches('/'),
            path
        )
    }

    async fn mapping_by_path(&self, path: &str) -> HttpResponse {
        let full_path = self.logical_path(path);
        match self.app.store.find_by_logical_path(&full_path).await {
            Some(mapping) => json_response(StatusCode::OK, &mapping),
            None => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "error": format!("Mapping not found for path: {full_path}") }),
            ),
        }
    }

    async fn file_by_path(&self, path: &str) -> HttpResponse {
        let full_path = self.logical_path(path);
        let Some(mapping) = self.app.store.find_by_logical_path(&full_path).await else {
            return json_response(
                StatusCode::NOT_FOUND,
                &json!({ "error": format!("Response file not found for path: {full_path}") }),
            );
        };

        match self.app.store.resolve_body(&mapping).await {
            Ok(body) => {
                let content_type = mapping
                    .response
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map_or("application/json", |(_, value)| value.as_str());
                create_response(StatusCode::OK, content_type, body)
            }
            Err(e) => error_response(&e),
        }
    }

    async fn health(&self) -> HttpResponse {
        let engine = self.app.store.status().await;
        let storage = match self.app.snapshots.list().await {
            Ok(_) => json!({ "status": "UP", "backend": self.app.snapshots.backend() }),
            Err(e) => {
                warn!("Storage health check failed: {}", e);
                json!({
                    "status": "DOWN",
                    "backend": self.app.snapshots.backend(),
                    "error": e.root().to_string(),
                })
            }
        };

        let storage_up = storage["status"] == "UP";
        let up = storage_up && engine.running;
        let status = if up {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        json_response(
            status,
            &json!({
                "status": if up { "UP" } else { "DOWN" },
                "storage": storage,
                "engine": {
                    "status": if engine.running { "UP" } else { "DOWN" },
                    "port": engine.port,
                    "mappings": engine.mappings,
                    "bodyFiles": engine.body_files,
                },
            }),
        )
    }
}

/// URL a mapping's request predicate matches, for listings
fn request_url(mapping: &Mapping) -> Option<String> {
    let request = &mapping.request;
    request
        .url
        .clone()
        .or_else(|| request.url_path.clone())
        .or_else(|| request.url_pattern.clone())
}

fn decode_segment(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |decoded| decoded.into_owned())
}
