//! Inventory and identity client request shapes against a mock server.

use laggard_connector::{
    ConnectorError, IdentityProvider, InventoryProvider, KandjiClient, OktaClient,
};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn kandji_page(start: usize, n: usize) -> Value {
    let devices: Vec<Value> = (start..start + n)
        .map(|i| {
            json!({
                "serial_number": format!("SN{i:04}"),
                "os_version": "13.2",
                "platform": "Mac",
                "model": "MacBook Air",
                "device_name": format!("mac-{i}"),
                "user": {"email": format!("user{i}@example.com"), "name": "User", "id": i}
            })
        })
        .collect();
    Value::Array(devices)
}

#[tokio::test]
async fn kandji_pages_until_short_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/devices"))
        .and(header("authorization", "Bearer kandji-token"))
        .and(query_param("limit", "300"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kandji_page(0, 300)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/devices"))
        .and(query_param("offset", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kandji_page(300, 2)))
        .expect(1)
        .mount(&server)
        .await;

    let devices = KandjiClient::new(server.uri(), "kandji-token")
        .list_all()
        .await
        .unwrap();

    assert_eq!(devices.len(), 302);
    assert_eq!(devices[301].serial_number, "SN0301");
    assert_eq!(devices[0].owner_email, "user0@example.com");
}

#[tokio::test]
async fn kandji_error_status_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/devices"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let err = KandjiClient::new(server.uri(), "bad")
        .list_all()
        .await
        .unwrap_err();
    match err {
        ConnectorError::Api { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "unauthorized");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn okta_follows_next_link_and_skips_service_accounts() {
    let server = MockServer::start().await;
    let next = format!("<{}/api/v1/users?after=00u2>; rel=\"next\"", server.uri());

    Mock::given(method("GET"))
        .and(path("/api/v1/users"))
        .and(header("authorization", "SSWS okta-token"))
        .and(query_param("limit", "200"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", next.as_str())
                .set_body_json(json!([
                    {"id": "00u1", "profile": {
                        "email": "sam@example.com",
                        "managerId": "frodo@example.com",
                        "firstName": "Samwise", "lastName": "Gamgee"
                    }},
                    {"id": "00u9", "profile": {
                        "email": "svc-backup@example.com",
                        "userType": "Service Account"
                    }}
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/users"))
        .and(query_param("after", "00u2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "00u2", "profile": {
                "email": "frodo@example.com",
                "firstName": "Frodo", "lastName": "Baggins"
            }}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let people = OktaClient::new(server.uri(), "okta-token")
        .list_all_people()
        .await
        .unwrap();

    let emails: Vec<&str> = people.iter().map(|p| p.email.as_str()).collect();
    assert_eq!(emails, vec!["sam@example.com", "frodo@example.com"]);
    assert_eq!(people[0].manager_email, "frodo@example.com");
    assert!(people[1].manager_email.is_empty());
}
