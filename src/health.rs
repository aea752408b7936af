//! Liveness and metrics endpoints. Neither touches the engine or the disk.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /` and `GET /health`: static service facts plus uptime.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let engine = &state.config.engine;

    HttpResponse::Ok().json(json!({
        "status": "online",
        "model": state.pipeline.model_name(),
        "workers": state.pipeline.workers(),
        "language": engine.language.as_deref().unwrap_or("auto"),
        "device": state.device,
        "beam_size": engine.beam_size,
        "vad_filter": engine.vad_filter,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.get_uptime_seconds()
    }))
}

/// `GET /metrics`: per-endpoint request statistics and transcription counters.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let transcriptions = &metrics.transcriptions;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "transcriptions": {
            "succeeded": transcriptions.succeeded,
            "rejected": transcriptions.rejected,
            "failed": transcriptions.failed,
            "no_speech": transcriptions.no_speech,
            "average_processing_ms": transcriptions.average_processing_ms(),
            "total_audio_seconds": transcriptions.total_audio_seconds,
            "in_flight": state.pipeline.in_flight(),
            "workers": state.pipeline.workers()
        },
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, where the platform exposes it.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
