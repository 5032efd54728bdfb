use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::Url;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::SubscriberEmail;
use crate::idempotency::IdempotencyKey;
use crate::utils::error_chain_fmt;

/// Message used whenever Square fails without telling us why
pub const FALLBACK_MESSAGE: &str = "Square error";

/// Thin client for the handful of Square Customers API endpoints we need.
///
/// Like any `reqwest::Client`, it keeps a connection pool, so a single
/// instance should be built at startup and shared (via `web::Data`) by all
/// workers.
#[derive(Debug)]
pub struct SquareClient {
    http_client: Client,
    /// Always usable as a base: path segments can be appended to it
    base_url: Url,
    /// `None` when no token was configured; every call then fails before
    /// touching the network.
    access_token: Option<Secret<String>>,
    api_version: String,
}

/// Opaque Square customer identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
}

impl AsRef<str> for CustomerId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl Display for CustomerId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The parts of a Square customer record we read back. Everything else in the
/// response is ignored.
#[derive(Debug, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
}

/// Fields written on both update and create. `given_name` is left out of the
/// payload when `None`, so that Square keeps whatever it already has.
#[derive(Debug, Serialize)]
pub struct CustomerDetails<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<&'a str>,
    pub email_address: &'a str,
    pub note: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CustomAttribute<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub visibility: &'a str,
}

#[derive(Serialize)]
struct SearchCustomersRequest<'a> {
    query: SearchQuery<'a>,
}

#[derive(Serialize)]
struct SearchQuery<'a> {
    filter: CustomerFilter<'a>,
}

#[derive(Serialize)]
struct CustomerFilter<'a> {
    email_address: ExactFilter<'a>,
}

#[derive(Serialize)]
struct ExactFilter<'a> {
    exact: &'a str,
}

#[derive(Deserialize)]
struct SearchCustomersResponse {
    // absent (not empty) when nothing matched
    #[serde(default)]
    customers: Vec<Customer>,
}

#[derive(Serialize)]
struct CreateCustomerRequest<'a> {
    idempotency_key: &'a str,
    #[serde(flatten)]
    details: &'a CustomerDetails<'a>,
    reference_id: &'a str,
}

#[derive(Deserialize)]
struct CreateCustomerResponse {
    customer: Customer,
}

#[derive(Serialize)]
struct UpsertCustomAttributeRequest<'a> {
    custom_attribute: &'a CustomAttribute<'a>,
}

/// Square's error envelope: `{"errors": [{"category", "code", "detail"}]}`
#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    detail: Option<String>,
}

impl ErrorResponse {
    /// The first human-readable message, falling back to the error code
    fn into_message(self) -> Option<String> {
        self.errors
            .into_iter()
            .next()
            .and_then(|e| e.detail.or(e.code))
            .filter(|m| !m.is_empty())
    }
}

#[derive(thiserror::Error)]
pub enum SquareError {
    #[error("Square access token is not configured")]
    MissingAccessToken,
    #[error("timeout")]
    Timeout(#[source] reqwest::Error),
    #[error("{0}")]
    Transport(#[source] reqwest::Error),
    #[error("{}", .message.as_deref().unwrap_or(FALLBACK_MESSAGE))]
    Api {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("Square error")]
    UnexpectedResponse(#[source] reqwest::Error),
}

impl std::fmt::Debug for SquareError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl SquareError {
    fn transport(e: reqwest::Error) -> Self {
        match e.is_timeout() {
            true => Self::Timeout(e),
            false => Self::Transport(e),
        }
    }

    fn body(e: reqwest::Error) -> Self {
        match e.is_timeout() {
            true => Self::Timeout(e),
            false => Self::UnexpectedResponse(e),
        }
    }
}

impl SquareClient {
    pub fn new(
        base_url: String,
        access_token: Option<Secret<String>>,
        api_version: String,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let base_url =
            Url::parse(&base_url).with_context(|| format!("invalid Square base url {base_url:?}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Square base url {base_url} cannot have a path");
        }
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url,
            access_token,
            api_version,
        })
    }

    /// `<base_url>/v2/<segments>`, each segment percent-encoded, so that ids
    /// containing `/` or `?` stay within their own segment
    fn url(
        &self,
        segments: &[&str],
    ) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base urls, so this always succeeds
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v2").extend(segments);
        }
        url
    }

    /// Authenticate and send a request, turning any non-2xx status into a
    /// `SquareError::Api`
    async fn send(
        &self,
        request: RequestBuilder,
    ) -> Result<Response, SquareError> {
        let token = self
            .access_token
            .as_ref()
            .ok_or(SquareError::MissingAccessToken)?;

        let resp = request
            .bearer_auth(token.expose_secret())
            .header("Square-Version", &self.api_version)
            .send()
            .await
            .map_err(SquareError::transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.into_message(),
            Err(e) if e.is_timeout() => return Err(SquareError::Timeout(e)),
            // no (readable) envelope; fall back to the generic message
            Err(_) => None,
        };
        Err(SquareError::Api { status, message })
    }

    /// `POST /v2/customers/search`, filtering on the exact (lower-cased)
    /// email address. Matches come back in Square's order; an empty `Vec`
    /// means no customer has this address (or Square has not indexed it yet).
    #[tracing::instrument(name = "Searching Square customers by email", skip(self))]
    pub async fn search_customers_by_email(
        &self,
        email: &SubscriberEmail,
    ) -> Result<Vec<Customer>, SquareError> {
        let search_key = email.search_key();
        let body = SearchCustomersRequest {
            query: SearchQuery {
                filter: CustomerFilter {
                    email_address: ExactFilter { exact: &search_key },
                },
            },
        };
        let resp = self
            .send(
                self.http_client
                    .post(self.url(&["customers", "search"]))
                    .json(&body),
            )
            .await?;
        let found: SearchCustomersResponse = resp.json().await.map_err(SquareError::body)?;
        Ok(found.customers)
    }

    /// `PUT /v2/customers/{id}`; fields not in `details` are left untouched
    #[tracing::instrument(name = "Updating Square customer", skip(self, details))]
    pub async fn update_customer(
        &self,
        customer_id: &CustomerId,
        details: &CustomerDetails<'_>,
    ) -> Result<(), SquareError> {
        self.send(
            self.http_client
                .put(self.url(&["customers", customer_id.as_ref()]))
                .json(details),
        )
        .await?;
        Ok(())
    }

    /// `POST /v2/customers`
    #[tracing::instrument(
        name = "Creating Square customer",
        skip(self, idempotency_key, details),
        fields(idempotency_key = %idempotency_key.as_ref())
    )]
    pub async fn create_customer(
        &self,
        idempotency_key: &IdempotencyKey,
        details: &CustomerDetails<'_>,
        reference_id: &str,
    ) -> Result<Customer, SquareError> {
        let body = CreateCustomerRequest {
            idempotency_key: idempotency_key.as_ref(),
            details,
            reference_id,
        };
        let resp = self
            .send(self.http_client.post(self.url(&["customers"])).json(&body))
            .await?;
        let created: CreateCustomerResponse = resp.json().await.map_err(SquareError::body)?;
        Ok(created.customer)
    }

    /// `POST /v2/customers/{id}/custom-attributes/{key}`
    #[tracing::instrument(
        name = "Upserting Square customer custom attribute",
        skip(self, attribute),
        fields(key = %attribute.key)
    )]
    pub async fn upsert_custom_attribute(
        &self,
        customer_id: &CustomerId,
        attribute: &CustomAttribute<'_>,
    ) -> Result<(), SquareError> {
        let body = UpsertCustomAttributeRequest {
            custom_attribute: attribute,
        };
        self.send(
            self.http_client
                .post(self.url(&[
                    "customers",
                    customer_id.as_ref(),
                    "custom-attributes",
                    attribute.key,
                ]))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    /// `PUT /v2/customers/{id}/groups/{group_id}`
    #[tracing::instrument(name = "Adding Square customer to group", skip(self))]
    pub async fn add_group_to_customer(
        &self,
        customer_id: &CustomerId,
        group_id: &str,
    ) -> Result<(), SquareError> {
        self.send(
            self.http_client
                .put(self.url(&["customers", customer_id.as_ref(), "groups", group_id])),
        )
        .await?;
        Ok(())
    }
}
