use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration after file and environment layering.
///
/// Read-only. Sessions capture the recognition section when they connect.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": config.server,
            "stream": {
                "host": config.stream.host,
                "port": config.stream.port,
                "join_timeout_ms": config.stream.join_timeout_ms,
                "max_connection_time_secs": config.stream.max_connection_time_secs,
                "max_frame_bytes": config.stream.max_frame_bytes
            },
            "recognition": config.recognition,
            "performance": config.performance
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_reports_layers() {
        let mut config = AppConfig::default();
        config.recognition.language = "de".to_string();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["recognition"]["language"], "de");
        assert_eq!(body["config"]["stream"]["port"], 9090);
        assert_eq!(body["config"]["performance"]["max_concurrent_sessions"], 4);
    }
}
