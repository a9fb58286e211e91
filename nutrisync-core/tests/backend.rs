use nutrisync_core::{
    AnalysisRecord, BackendClient, BackendError, Confidence, FoodItem, NutritionFacts,
    NutritionReport,
};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_report() -> NutritionReport {
    let facts = NutritionFacts {
        calories: 150.0,
        protein: 5.0,
        carbs: 25.0,
        fat: 5.0,
        fiber: 1.0,
    };
    NutritionReport {
        foods: vec![FoodItem {
            name: "Dosa".into(),
            portion: "1 dosa".into(),
            weight_g: 100.0,
            nutrition: facts.clone(),
        }],
        total: facts,
        confidence: Confidence::High,
    }
}

#[tokio::test]
async fn save_analysis_posts_camel_case_record() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .and(header_exists("user-agent"))
        .and(body_partial_json(json!({
            "userId": "42",
            "imagePath": "/DCIM/a.jpg",
            "timestamp": 1_700_000_000_000i64,
            "deviceInfo": "nutrisyncd",
            "analysisResult": { "confidence": "high", "total": { "calories": 150.0 } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "id": 17,
            "message": "Analysis saved successfully"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    let report = sample_report();
    let receipt = client
        .save_analysis(&AnalysisRecord {
            user_id: "42",
            image_path: "/DCIM/a.jpg",
            analysis_result: &report,
            timestamp: 1_700_000_000_000,
            device_info: "nutrisyncd",
        })
        .await
        .unwrap();

    assert!(receipt.success);
    assert_eq!(receipt.id, Some(17));
}

#[tokio::test]
async fn save_analysis_reports_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "success": false,
            "message": "Failed to save analysis"
        })))
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    let report = sample_report();
    let err = client
        .save_analysis(&AnalysisRecord {
            user_id: "42",
            image_path: "/DCIM/a.jpg",
            analysis_result: &report,
            timestamp: 0,
            device_info: "nutrisyncd",
        })
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::Api { status, .. } if status.as_u16() == 500));
}

#[tokio::test]
async fn lookup_user_id_accepts_numeric_ids() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/lookup-user-id"))
        .and(body_json(json!({ "email": "a@x.com", "firebaseUid": "uid-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "userId": 42,
            "userName": "A",
            "email": "a@x.com"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    let id = client
        .lookup_user_id(Some("a@x.com"), Some("uid-1"))
        .await
        .unwrap();

    assert_eq!(id.as_deref(), Some("42"));
}

#[tokio::test]
async fn lookup_user_id_omits_missing_fields() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/lookup-user-id"))
        .and(body_json(json!({ "email": "a@x.com" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "userId": "u-7"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    let id = client.lookup_user_id(Some("a@x.com"), None).await.unwrap();

    assert_eq!(id.as_deref(), Some("u-7"));
}

#[tokio::test]
async fn lookup_user_id_not_found_is_none() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/lookup-user-id"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "message": "User not found in team_table"
        })))
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    let id = client.lookup_user_id(Some("nobody@x.com"), None).await.unwrap();

    assert_eq!(id, None);
}

#[tokio::test]
async fn lookup_user_id_requires_a_key() {
    let client = BackendClient::new("http://127.0.0.1:9").unwrap();
    let err = client.lookup_user_id(Some(""), None).await.unwrap_err();
    assert!(matches!(err, BackendError::MissingLookupKey));
}

#[tokio::test]
async fn health_check_maps_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/service-health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "healthy" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/service-health"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "status": "unhealthy" })))
        .mount(&server)
        .await;

    let client = BackendClient::new(&server.uri()).unwrap();
    assert!(client.health_check().await.is_ok());
    assert!(client.health_check().await.is_err());
}

#[tokio::test]
async fn base_url_path_prefix_is_preserved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app/api/service-health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/app/api/lookup-user-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "success": true, "userId": 5 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = BackendClient::new(&format!("{}/app", server.uri())).unwrap();

    client.health_check().await.unwrap();
    let id = client.lookup_user_id(Some("a@x.com"), None).await.unwrap();
    assert_eq!(id.as_deref(), Some("5"));
}
