use crate::state::{AppMetrics, AppState};
use crate::transcription::EngineFactory;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(
    state: web::Data<AppState>,
    engine: web::Data<dyn EngineFactory>,
) -> HttpResponse {
    let config = state.get_config();
    let active_sessions = state.active_sessions();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "stream": {
            "endpoint": format!("ws://{}", config.stream_addr()),
            "active_sessions": active_sessions,
            "max_sessions": config.performance.max_concurrent_sessions
        },
        "engine": {
            "name": engine.name(),
            "model": config.recognition.model,
            "realtime_model": if config.recognition.enable_realtime_transcription {
                Some(config.recognition.realtime_model.as_str())
            } else {
                None
            },
            "language": config.recognition.language
        },
        "memory": get_memory_info(),
        "system": get_system_status(active_sessions, config.performance.max_concurrent_sessions)
    }))
}

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

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "endpoints": endpoint_stats
        },
        "sessions": {
            "active": state.active_sessions(),
            "totals": metrics.bridge
        },
        "memory": get_memory_info()
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let read_kb = |key: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(key))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {} on this platform", process::id())
    })
}

/// Load classification from session usage. Each session owns a full engine, so
/// usage near the limit mostly means memory pressure.
fn get_system_status(current: usize, max: usize) -> serde_json::Value {
    let session_usage = if max > 0 { current as f64 / max as f64 } else { 0.0 };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max,
        "current_sessions": current,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::testing::ScriptedFactory;
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;
    use std::sync::Arc;

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(0, 4)["status"], "normal");
        assert_eq!(get_system_status(3, 4)["status"], "moderate_load");
        assert_eq!(get_system_status(4, 4)["status"], "high_load");
        assert_eq!(get_system_status(1, 0)["session_usage_percent"], 0.0);
    }

    #[actix_web::test]
    async fn test_health_reports_sessions_and_engine() {
        let state = AppState::new(AppConfig::default());
        state.open_session("127.0.0.1:5000", Default::default(), 4).unwrap();
        let factory: Arc<dyn EngineFactory> = Arc::new(ScriptedFactory::default());

        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .app_data(web::Data::from(factory))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["stream"]["active_sessions"], 1);
        assert_eq!(body["stream"]["endpoint"], "ws://localhost:9090");
        assert_eq!(body["engine"]["name"], "scripted");
    }
}
