use std::time::Duration;

use secrecy::Secret;
use wiremock::matchers::any;
use wiremock::matchers::body_json;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::header;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::add_to_any_group;
use crate::helpers::create_customer;
use crate::helpers::created;
use crate::helpers::found;
use crate::helpers::json_body;
use crate::helpers::not_found;
use crate::helpers::ok_json;
use crate::helpers::search_customers;
use crate::helpers::spawn_app;
use crate::helpers::spawn_app_with;
use crate::helpers::update_customer;
use crate::helpers::upsert_opt_in;

const NOTE: &str = "Marketing: consent=true (source: website)";

fn jo() -> serde_json::Value {
    serde_json::json!({ "first_name": "Jo", "email": "jo@example.com", "consent": true })
}

/// New address: search comes back empty, so a customer is created
#[tokio::test]
async fn new_subscriber_is_created() {
    let app = spawn_app().await;

    search_customers()
        .and(body_json(serde_json::json!({
            "query": { "filter": { "email_address": { "exact": "jo@example.com" } } }
        })))
        .respond_with(not_found())
        .expect(1)
        .mount(&app.square_server)
        .await;
    create_customer()
        .and(body_partial_json(serde_json::json!({
            "given_name": "Jo",
            "email_address": "jo@example.com",
            "reference_id": "newsletter",
            "note": NOTE,
        })))
        .respond_with(created("NEW1"))
        .expect(1)
        .mount(&app.square_server)
        .await;
    upsert_opt_in("NEW1")
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;
    Mock::given(path("/v2/customers/NEW1"))
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true, "customerId": "NEW1" }));

    let reqs = app.square_server.received_requests().await.unwrap();
    let create = reqs
        .iter()
        .find(|r| r.url.path() == "/v2/customers")
        .unwrap();
    let key = json_body(create)["idempotency_key"]
        .as_str()
        .unwrap()
        .to_owned();
    assert!(!key.is_empty() && key.len() <= 45, "{key}");
}

/// Known address: the first match is updated, nothing is created
#[tokio::test]
async fn existing_subscriber_is_updated() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(found(&["CUST1", "CUST2"]))
        .expect(1)
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .and(body_json(serde_json::json!({
            "given_name": "Jo",
            "email_address": "jo@example.com",
            "note": NOTE,
        })))
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;
    update_customer("CUST2")
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1"))
        .expect(0)
        .mount(&app.square_server)
        .await;
    upsert_opt_in("CUST1")
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true, "customerId": "CUST1" }));
}

/// Search is case-insensitive, but Square stores the address as submitted
#[tokio::test]
async fn search_uses_lowercased_email() {
    let app = spawn_app().await;

    search_customers()
        .and(body_partial_json(serde_json::json!({
            "query": { "filter": { "email_address": { "exact": "jo@example.com" } } }
        })))
        .respond_with(found(&["CUST1"]))
        .expect(1)
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .and(body_partial_json(
            serde_json::json!({ "email_address": "Jo@Example.COM" }),
        ))
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app
        .post_newsletter(&serde_json::json!({ "email": "Jo@Example.COM", "consent": true }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
}

/// Without a first name, `given_name` is left out so Square keeps the old one
#[tokio::test]
async fn missing_first_name_is_not_sent() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(found(&["CUST1"]))
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .and(body_json(serde_json::json!({
            "email_address": "jo@example.com",
            "note": NOTE,
        })))
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app
        .post_newsletter(&serde_json::json!({
            "first_name": "",
            "email": "jo@example.com",
            "consent": true
        }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
}

/// Subscribing twice leaves a single customer: create, then update
#[tokio::test]
async fn subscribing_twice_creates_one_customer() {
    let app = spawn_app().await;

    // the first search finds nothing, later ones find the created customer
    search_customers()
        .respond_with(not_found())
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&app.square_server)
        .await;
    search_customers()
        .respond_with(found(&["NEW1"]))
        .expect(1)
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1"))
        .expect(1)
        .mount(&app.square_server)
        .await;
    update_customer("NEW1")
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    for _ in 0..2 {
        let resp = app.post_newsletter(&jo()).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["customerId"], "NEW1");
    }
}

/// Every create carries its own idempotency key
#[tokio::test]
async fn idempotency_keys_are_fresh() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(not_found())
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1"))
        .expect(2)
        .mount(&app.square_server)
        .await;

    for _ in 0..2 {
        app.post_newsletter(&jo()).await;
    }

    let keys: Vec<_> = app
        .square_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/v2/customers")
        .map(|r| json_body(r)["idempotency_key"].clone())
        .collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn square_requests_are_authenticated() {
    let app = spawn_app_with(|c| {
        c.square.access_token = Some(Secret::new("sq0-test-token".to_string()));
        c.square.api_version = "2024-07-17".to_string();
    })
    .await;

    search_customers()
        .and(header("Authorization", "Bearer sq0-test-token"))
        .and(header("Square-Version", "2024-07-17"))
        .respond_with(found(&["CUST1"]))
        .expect(1)
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .and(header("Authorization", "Bearer sq0-test-token"))
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;
    assert_eq!(resp.status().as_u16(), 200);
}

/// Tagging is best effort; its failure is invisible to the caller
#[tokio::test]
async fn failed_consent_tagging_still_succeeds() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(found(&["CUST1"]))
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .respond_with(ok_json())
        .mount(&app.square_server)
        .await;
    upsert_opt_in("CUST1")
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "errors": [{ "category": "API_ERROR", "code": "INTERNAL_SERVER_ERROR", "detail": "boom" }]
        })))
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.text().await.unwrap();
    assert!(!body.contains("boom"), "{body}");
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true, "customerId": "CUST1" }));
}

#[tokio::test]
async fn no_group_configured() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(found(&["CUST1"]))
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .respond_with(ok_json())
        .mount(&app.square_server)
        .await;
    add_to_any_group()
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn customer_is_added_to_configured_group() {
    let app = spawn_app_with(|c| c.square.newsletter_group_id = Some("GRP1".to_string())).await;

    search_customers()
        .respond_with(not_found())
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1"))
        .mount(&app.square_server)
        .await;
    Mock::given(path("/v2/customers/NEW1/groups/GRP1"))
        .respond_with(ok_json())
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;
    assert_eq!(resp.status().as_u16(), 200);
}

/// Group assignment is best effort too
#[tokio::test]
async fn failed_group_assignment_still_succeeds() {
    let app = spawn_app_with(|c| c.square.newsletter_group_id = Some("GRP1".to_string())).await;

    search_customers()
        .respond_with(found(&["CUST1"]))
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .respond_with(ok_json())
        .mount(&app.square_server)
        .await;
    add_to_any_group()
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true, "customerId": "CUST1" }));
}

#[tokio::test]
async fn create_timeout_is_a_server_error() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(not_found())
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1").set_delay(Duration::from_secs(180)))
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "timeout" }));
}

#[tokio::test]
async fn search_failure_is_a_server_error() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "errors": [{
                "category": "AUTHENTICATION_ERROR",
                "code": "UNAUTHORIZED",
                "detail": "This request could not be authorized."
            }]
        })))
        .expect(1)
        .mount(&app.square_server)
        .await;
    create_customer()
        .respond_with(created("NEW1"))
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "error": "This request could not be authorized." })
    );
}

#[tokio::test]
async fn update_failure_without_details() {
    let app = spawn_app().await;

    search_customers()
        .respond_with(found(&["CUST1"]))
        .mount(&app.square_server)
        .await;
    update_customer("CUST1")
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&app.square_server)
        .await;
    upsert_opt_in("CUST1")
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;

    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Square error" }));
}

#[tokio::test]
async fn missing_access_token_fails_every_subscription() {
    let app = spawn_app_with(|c| c.square.access_token = None).await;

    Mock::given(any())
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app.post_newsletter(&jo()).await;
    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
}

/// Missing email or falsy consent: 400, and Square is never called
#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let app = spawn_app().await;

    Mock::given(any())
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    for (body, msg) in [
        ("", "empty body"),
        ("{}", "empty object"),
        (r#"{"first_name":"Jo","consent":true}"#, "no email"),
        (r#"{"email":"","consent":true}"#, "empty email"),
        (r#"{"email":"jo@example.com"}"#, "no consent"),
        (r#"{"email":"jo@example.com","consent":false}"#, "false consent"),
        (r#"{"email":"jo@example.com","consent":null}"#, "null consent"),
        (r#"[{"email":"jo@example.com","consent":true}]"#, "not an object"),
    ] {
        let resp = app
            .post_newsletter_raw(body.to_string(), Some(crate::helpers::ALLOWED_ORIGIN))
            .await;
        assert_eq!(resp.status().as_u16(), 400, "{msg}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "error": "Email and consent are required." }),
            "{msg}"
        );
    }
}

#[tokio::test]
async fn malformed_json_is_a_server_error() {
    let app = spawn_app().await;

    Mock::given(any())
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app
        .post_newsletter_raw(
            "email=jo%40example.com&consent=true".to_string(),
            Some(crate::helpers::ALLOWED_ORIGIN),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
}

/// A given email that is not a string cannot be sent on to Square
#[tokio::test]
async fn non_string_email_is_a_server_error() {
    let app = spawn_app().await;

    Mock::given(any())
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    for email in [
        serde_json::json!(42),
        serde_json::json!(true),
        serde_json::json!({ "a": 1 }),
    ] {
        let resp = app
            .post_newsletter(&serde_json::json!({ "email": email, "consent": true }))
            .await;
        assert_eq!(resp.status().as_u16(), 500, "{email}");
        let body: serde_json::Value = resp.json().await.unwrap();
        let error = body["error"].as_str().unwrap();
        assert!(error.starts_with("Expected email to be a string"), "{error}");
    }
}

#[tokio::test]
async fn html_form_post_subscribes() {
    let app = spawn_app().await;

    search_customers()
        .and(body_partial_json(serde_json::json!({
            "query": { "filter": { "email_address": { "exact": "jo@example.com" } } }
        })))
        .respond_with(not_found())
        .expect(1)
        .mount(&app.square_server)
        .await;
    create_customer()
        .and(body_partial_json(serde_json::json!({
            "given_name": "Jo",
            "email_address": "jo@example.com",
        })))
        .respond_with(created("NEW1"))
        .expect(1)
        .mount(&app.square_server)
        .await;

    let resp = app
        .post_newsletter_form(&[
            ("first_name", "Jo"),
            ("email", "jo@example.com"),
            ("consent", "on"),
        ])
        .await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "ok": true, "customerId": "NEW1" }));
}

#[tokio::test]
async fn html_form_without_consent_is_rejected() {
    let app = spawn_app().await;

    Mock::given(any())
        .respond_with(ok_json())
        .expect(0)
        .mount(&app.square_server)
        .await;

    let resp = app
        .post_newsletter_form(&[("email", "jo@example.com")])
        .await;

    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Email and consent are required." }));
}
