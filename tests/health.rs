mod common;

use reqwest::Client;

#[tokio::test]
async fn test_health_check_works() {
    let app = common::spawn_server().await;

    let response = Client::new()
        .get(format!("{}/health", app.addr))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}
