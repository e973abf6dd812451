mod common;

use common::TestApp;
use serde_json::json;

#[tokio::test]
async fn feedback_on_remote_id_resolves_local_message() {
    let app = TestApp::spawn().await;

    let reply = app.chat("sess-fb", "Rate this answer").await;
    let local_id = reply["message_id"].as_str().unwrap().to_string();

    let remote_id = app.wait_for_remote_id("sess-fb", "Rate this answer").await;

    let response = app
        .post_json(
            "/feedback",
            &json!({ "messageId": remote_id, "isPositive": true, "content": "great" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 202);

    let receipt: serde_json::Value = response.json().await.unwrap();
    assert_eq!(receipt["resolved"], true);
    assert_eq!(receipt["local_id"], local_id.as_str());
    assert_eq!(receipt["remote_id"], remote_id.as_str());

    assert!(app.wait_until(|a| a.analytics.feedback_count() == 1).await);
    let forwarded = app.analytics.feedback.lock().unwrap()[0].clone();
    assert_eq!(forwarded["message_id"], remote_id.as_str());
    assert_eq!(forwarded["is_positive"], true);
}

#[tokio::test]
async fn feedback_on_local_id_resolves_too() {
    let app = TestApp::spawn().await;

    let reply = app.chat("sess-fb2", "Another answer").await;
    let local_id = reply["message_id"].as_str().unwrap().to_string();
    // The mapping exists once the cached reply has been back-filled.
    app.wait_for_remote_id("sess-fb2", "Another answer").await;

    let response = app
        .post_json(
            "/feedback",
            &json!({ "message_id": local_id, "is_positive": false }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 202);

    let receipt: serde_json::Value = response.json().await.unwrap();
    assert_eq!(receipt["resolved"], true);
    assert_eq!(receipt["remote_id"], "pg-1-1");
}

#[tokio::test]
async fn unknown_id_is_accepted_unresolved() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            "/feedback",
            &json!({ "messageId": "never-seen", "isPositive": false }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 202);

    let receipt: serde_json::Value = response.json().await.unwrap();
    assert_eq!(receipt["resolved"], false);
    assert_eq!(receipt["persisted"], true);
    assert_eq!(app.analytics.feedback_count(), 0);
}

#[tokio::test]
async fn missing_message_id_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json("/feedback", &json!({ "messageId": "", "isPositive": true }))
        .await;
    assert_eq!(response.status().as_u16(), 422);
}
