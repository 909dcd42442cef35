use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration, after every source has been merged.
///
/// ## Endpoint: `GET /api/v1/config`
///
/// Read-only: the queue, pool and cache are sized once at startup, so a
/// runtime update would not reach them.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.as_ref()
    })))
}

#[cfg(test)]
mod tests {
    use crate::handlers::routes;
    use crate::state::testing::test_state;
    use actix_web::{test, web, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_config_lists_every_section() {
        let (state, _rx, _dirs) = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/config").to_request()).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        for section in ["server", "queue", "cache", "fetch", "transcribe", "metadata", "jobs"] {
            assert!(body["config"][section].is_object(), "missing {}", section);
        }
        assert_eq!(body["config"]["transcribe"]["model"], "tiny");
    }
}
