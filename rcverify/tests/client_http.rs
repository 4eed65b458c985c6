mod common;

use rcverify::prelude::*;
use std::time::Duration;

fn client_for(base_url: &str) -> VerifyClient {
    VerifyClient::new(ClientConfig::new(base_url)).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let backend = common::spawn().await;
    let health = client_for(&backend.base_url).health_check().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.version.as_deref(), Some("1.4.2"));
}

#[tokio::test]
async fn test_upload_from_disk() {
    let backend = common::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tower.xlsx");
    let contents = b"PK\x03\x04 not really a workbook";
    std::fs::write(&path, contents).unwrap();

    let outcome = client_for(&backend.base_url).upload(&path).await.unwrap();

    assert_eq!(outcome.session_id, SessionId::new(common::SESSION));
    assert_eq!(outcome.summary.piers.len(), 2);
    assert_eq!(outcome.summary.columns.len(), 1);
    assert_eq!(
        outcome.summary.columns[0].reinforcement.longitudinal_bar_count,
        Some(8)
    );
    let uploads = backend.state.uploads.lock().unwrap().clone();
    assert_eq!(uploads, vec![("tower.xlsx".to_string(), contents.len())]);
}

#[tokio::test]
async fn test_upload_rejects_non_spreadsheet_before_sending() {
    let backend = common::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tower.e2k");
    std::fs::write(&path, b"$ PROGRAM INFORMATION").unwrap();

    let err = client_for(&backend.base_url).upload(&path).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
    assert!(backend.state.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_failure_is_server_error() {
    let backend = common::spawn().await;
    let err = client_for(&backend.base_url)
        .upload_bytes("empty.xlsx", Vec::new())
        .await
        .unwrap_err();
    assert!(err.is_server());
    assert_eq!(err.user_message(), "Uploaded file is empty");
}

#[tokio::test]
async fn test_analyze_full_batch() {
    let backend = common::spawn().await;
    let request = AnalysisRequest::new(SessionId::new(common::SESSION));
    let batch = client_for(&backend.base_url).analyze(&request).await.unwrap();

    assert_eq!(batch.len(), 3);
    assert_eq!(batch.category(ElementCategory::Pier).len(), 2);
    assert_eq!(batch.category(ElementCategory::Column).len(), 1);

    let p1 = batch.get(&ElementKey::new("L1", "P1")).unwrap();
    assert_eq!(p1.governing_check().unwrap().mode, "shear");
    assert_eq!(p1.critical_combination.as_deref(), Some("1.2D+1.6L"));
    assert_eq!(p1.extra.get("pier_type").and_then(|v| v.as_str()), Some("wall"));
    assert_eq!(p1.geometry.thickness_mm, Some(250.0));
}

#[tokio::test]
async fn test_analyze_sends_flattened_element_update() {
    let backend = common::spawn().await;
    let key = ElementKey::new("L2", "C1");
    let request = AnalysisRequest::new(SessionId::new(common::SESSION)).with_update(
        ElementUpdate::new(
            &key,
            ReinforcementConfig {
                stirrup_diameter_mm: Some(12.0),
                stirrup_spacing_mm: Some(100.0),
                ..Default::default()
            },
        ),
    );

    let batch = client_for(&backend.base_url).analyze(&request).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(
        batch.category(ElementCategory::Column)[0].critical_combination.as_deref(),
        Some("0.9D+1.0E")
    );

    let sent = backend.state.last_analyze_request();
    let update = &sent["element_updates"][0];
    assert_eq!(update["story"], "L2");
    assert_eq!(update["label"], "C1");
    assert_eq!(update["stirrup_diameter_mm"], 12.0);
    assert!(update.get("vertical_bar_diameter_mm").is_none());
}

#[tokio::test]
async fn test_analyze_failures() {
    let backend = common::spawn().await;
    let client = client_for(&backend.base_url);

    let err = client
        .analyze(&AnalysisRequest::new(SessionId::new("rejected")))
        .await
        .unwrap_err();
    assert!(matches!(&err, ClientError::Server(m) if m == "Workbook has no pier forces"));

    // Error body on a non-2xx status is still the server's message
    let err = client
        .analyze(&AnalysisRequest::new(SessionId::new("missing")))
        .await
        .unwrap_err();
    assert!(matches!(&err, ClientError::Server(m) if m == "Session not found"));

    backend.state.fail_for("P2");
    let request = AnalysisRequest::new(SessionId::new(common::SESSION)).with_update(
        ElementUpdate::new(&ElementKey::new("L1", "P2"), ReinforcementConfig::default()),
    );
    let err = client.analyze(&request).await.unwrap_err();
    assert!(matches!(&err, ClientError::HttpStatus { status: 500, body } if body == "upstream exploded"));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_unreachable_service_is_transport_error() {
    let client = client_for(&common::dead_url().await);
    let err = client.health_check().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(err.user_message(), "Could not reach the analysis service");
}

#[tokio::test]
async fn test_combinations_and_detail() {
    let backend = common::spawn().await;
    let client = client_for(&backend.base_url);
    let session = SessionId::new(common::SESSION);
    let key = ElementKey::new("L1", "P1");

    let rows = client.combinations(&session, &key).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].name, "0.9D+1.0E P1");
    assert_eq!(rows[1].shear_dcr, None);

    let detail = client.combination_detail(&session, &key, 0).await.unwrap();
    assert_eq!(detail.name, "1.2D+1.6L");
    assert_eq!(detail.values["phi_mn_knm"], 410.5);

    let err = client.combination_detail(&session, &key, 7).await.unwrap_err();
    assert_eq!(err.user_message(), "Combination index out of range");

    let err = client
        .combinations(&SessionId::new("expired"), &key)
        .await
        .unwrap_err();
    assert!(err.is_server());
}

#[tokio::test]
async fn test_save_report() {
    let backend = common::spawn().await;
    let client = client_for(&backend.base_url);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tower.pdf");

    let mut config = ReportConfig::new(SessionId::new(common::SESSION));
    config.project_name = Some("Tower A".into());
    let size = client.save_report(&config, &path).await.unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), size);
    assert!(written.starts_with(b"%PDF"));
}

#[tokio::test]
async fn test_report_that_is_not_pdf_is_rejected() {
    let backend = common::spawn().await;
    let client = client_for(&backend.base_url);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.pdf");

    let mut config = ReportConfig::new(SessionId::new(common::SESSION));
    config.project_name = Some("broken".into());
    let err = client.save_report(&config, &path).await.unwrap_err();

    assert!(matches!(err, ClientError::Decode(_)));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_custom_endpoint_paths() {
    let backend = common::spawn().await;
    let mut config = ClientConfig::new(format!("{}/", backend.base_url));
    config.endpoints.health = "health".into();
    config.request_timeout = Duration::from_secs(5);

    let health = VerifyClient::new(config).unwrap().health_check().await.unwrap();
    assert_eq!(health.status, "healthy");
}
