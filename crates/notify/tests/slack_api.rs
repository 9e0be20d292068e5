//! Slack Web API contract tests against a mock server.

use laggard_notify::{Message, Notifier, NotifyError, SlackNotifier};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier(server: &MockServer) -> SlackNotifier {
    SlackNotifier::from_config("xoxb-test".into(), server.uri()).unwrap()
}

#[tokio::test]
async fn send_direct_posts_to_user_with_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(header("authorization", "Bearer xoxb-test"))
        .and(body_partial_json(json!({"channel": "U123"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "channel": "D456",
            "ts": "1709733600.000100"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let delivery = notifier(&server)
        .send_direct("U123", &Message::text("update please").with_ack_button())
        .await
        .unwrap();

    assert_eq!(delivery.channel, "D456");
    assert_eq!(delivery.sent_at.timestamp(), 1_709_733_600);
}

#[tokio::test]
async fn send_between_opens_conversation_first() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/conversations.open"))
        .and(body_partial_json(json!({"users": "U-MGR,U123"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "channel": {"id": "G789"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(body_partial_json(json!({"channel": "G789"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "channel": "G789",
            "ts": "1709733601.000000"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let delivery = notifier(&server)
        .send_between(&["U-MGR".to_string(), "U123".to_string()], &Message::text("hi both"))
        .await
        .unwrap();
    assert_eq!(delivery.channel, "G789");
}

#[tokio::test]
async fn api_error_surfaces_slack_error_code() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "error": "channel_not_found"
        })))
        .mount(&server)
        .await;

    let err = notifier(&server)
        .send_direct("U-GONE", &Message::text("hello"))
        .await
        .unwrap_err();
    match err {
        NotifyError::Api(msg) => assert!(msg.starts_with("channel_not_found")),
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_maps_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
        .mount(&server)
        .await;

    let err = notifier(&server)
        .post_channel("C-ALERTS", &Message::text("alert"))
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::RateLimited { retry_after_secs: 12 }));
}

#[tokio::test]
async fn lookup_by_email_returns_user_and_offset() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users.lookupByEmail"))
        .and(query_param("email", "frodo@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "user": {"id": "U123", "real_name": "Frodo Baggins", "tz_offset": -18000}
        })))
        .mount(&server)
        .await;

    let user = notifier(&server)
        .lookup_user_by_email("frodo@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.id, "U123");
    assert_eq!(user.tz_offset, -18_000);
}

#[tokio::test]
async fn lookup_unknown_email_is_none() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users.lookupByEmail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "error": "users_not_found"
        })))
        .mount(&server)
        .await;

    let user = notifier(&server)
        .lookup_user_by_email("nobody@example.com")
        .await
        .unwrap();
    assert!(user.is_none());
}
