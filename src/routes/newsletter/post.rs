use actix_web::web;
use actix_web::HttpMessage;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::field::display;
use tracing::Span;

use super::SubscribeError;
use crate::domain::GivenName;
use crate::domain::NewSubscriber;
use crate::domain::SubscriberEmail;
use crate::idempotency::IdempotencyKey;
use crate::square_client::CustomAttribute;
use crate::square_client::CustomerDetails;
use crate::square_client::CustomerId;
use crate::square_client::SquareClient;
use crate::square_client::SquareError;
use crate::startup::NewsletterGroup;

const REQUIRED_FIELDS: &str = "Email and consent are required.";

/// Written to the customer's note on both create and update
const CONSENT_NOTE: &str = "Marketing: consent=true (source: website)";

/// Marks customers created through this endpoint
const REFERENCE_ID: &str = "newsletter";

const OPT_IN_ATTRIBUTE: CustomAttribute<'static> = CustomAttribute {
    key: "newsletter_opt_in",
    value: "true",
    visibility: "VISIBILITY_READ_WRITE_VALUES",
};

/// Body sent by the signup form, either as JSON or as a plain HTML form post.
///
/// Fields are read the way the browser side thinks about them: a field that
/// is missing, `null`, `false`, `0` or `""` counts as not given. A given
/// `email` is kept as-is, whatever its type, and only rejected once the
/// required fields are known to be present.
#[derive(Deserialize, Default, Debug)]
pub struct SubscriptionForm {
    #[serde(default, deserialize_with = "non_empty_string")]
    first_name: Option<String>,
    #[serde(default, deserialize_with = "truthy_value")]
    email: Option<Value>,
    #[serde(default, deserialize_with = "truthy")]
    consent: bool,
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| is_truthy(&v))
}

fn truthy_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| is_truthy(&v).then_some(v))
}

fn non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

impl SubscriptionForm {
    /// `application/x-www-form-urlencoded` bodies are read as a flat map of
    /// strings (the last of repeated keys wins). Anything else is read as
    /// JSON: an empty body, or a document that is not an object, reads as
    /// `{}`. Only a body that cannot be parsed at all is an error.
    pub fn from_body(
        content_type: &str,
        body: &[u8],
    ) -> Result<Self, anyhow::Error> {
        if content_type.eq_ignore_ascii_case(FORM_URLENCODED) {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)?;
            let fields: Map<String, Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            return Ok(serde_json::from_value(Value::Object(fields))?);
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        match serde_json::from_slice::<Value>(body)? {
            value @ Value::Object(_) => Ok(serde_json::from_value(value)?),
            _ => Ok(Self::default()),
        }
    }
}

impl TryFrom<SubscriptionForm> for NewSubscriber {
    type Error = SubscribeError;
    fn try_from(value: SubscriptionForm) -> Result<Self, Self::Error> {
        let (Some(email), true) = (value.email, value.consent) else {
            return Err(SubscribeError::ValidationError(REQUIRED_FIELDS.to_string()));
        };
        let email = match email {
            Value::String(e) => {
                SubscriberEmail::parse(e).map_err(SubscribeError::ValidationError)?
            }
            other => return Err(SubscribeError::MalformedEmail(json_type(&other))),
        };
        let given_name = value.first_name.and_then(|n| GivenName::parse(n).ok());
        Ok(Self { given_name, email })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeResponse {
    ok: bool,
    customer_id: CustomerId,
}

/// `POST /api/newsletter`
///
/// Upserts the visitor as a Square customer, keyed by email:
///     1. search by (lower-cased) email
///     2. update the first match, or create a new customer
///     3. tag the customer with `newsletter_opt_in` (best effort)
///     4. add the customer to the newsletter group, if one is configured
///        (best effort)
///
/// Origin checking and CORS response headers are handled by
/// `cors::reject_forbidden_origins` before this runs.
///
/// # Request example
///
/// ```sh
///     curl -v -H 'Content-Type: application/json' \
///         --data '{"first_name":"Jo","email":"jo@example.com","consent":true}' \
///         http://127.0.0.1:8000/api/newsletter
///
///     # or, as a plain HTML form would send it
///     curl -v --data 'first_name=Jo&email=jo%40example.com&consent=on' \
///         http://127.0.0.1:8000/api/newsletter
/// ```
#[tracing::instrument(
    name = "Subscribing to the newsletter",
    skip(req, body, square_client, newsletter_group),
    fields(
        subscriber_email = tracing::field::Empty,
        customer_id = tracing::field::Empty,
    )
)]
pub async fn subscribe(
    req: HttpRequest,
    body: web::Bytes,
    square_client: web::Data<SquareClient>,
    newsletter_group: web::Data<NewsletterGroup>,
) -> Result<HttpResponse, SubscribeError> {
    let form = SubscriptionForm::from_body(req.content_type(), &body)
        .map_err(SubscribeError::MalformedBody)?;
    let new_sub: NewSubscriber = form.try_into()?;
    Span::current().record("subscriber_email", display(new_sub.email.as_ref()));

    let customer_id = upsert_customer(&square_client, &new_sub).await?;
    Span::current().record("customer_id", display(&customer_id));

    tag_consent(&square_client, &customer_id).await;
    if let Some(group_id) = newsletter_group.0.as_deref() {
        add_to_newsletter_group(&square_client, &customer_id, group_id).await;
    }

    Ok(HttpResponse::Ok().json(SubscribeResponse {
        ok: true,
        customer_id,
    }))
}

/// Update the first customer with this email, or create one. When several
/// customers share the address, the first one Square returns wins; no
/// de-duplication is attempted.
#[tracing::instrument(name = "Resolving Square customer", skip(square_client, new_sub))]
async fn upsert_customer(
    square_client: &SquareClient,
    new_sub: &NewSubscriber,
) -> Result<CustomerId, SquareError> {
    let details = CustomerDetails {
        given_name: new_sub.given_name.as_ref().map(|n| n.as_ref()),
        email_address: new_sub.email.as_ref(),
        note: CONSENT_NOTE,
    };

    let matches = square_client.search_customers_by_email(&new_sub.email).await?;
    match matches.into_iter().next() {
        Some(existing) => {
            square_client.update_customer(&existing.id, &details).await?;
            Ok(existing.id)
        }
        None => {
            let created = square_client
                .create_customer(&IdempotencyKey::generate(), &details, REFERENCE_ID)
                .await?;
            Ok(created.id)
        }
    }
}

/// Best effort: the outcome is logged and dropped, it never changes the
/// response.
async fn tag_consent(
    square_client: &SquareClient,
    customer_id: &CustomerId,
) {
    if let Err(e) = square_client
        .upsert_custom_attribute(customer_id, &OPT_IN_ATTRIBUTE)
        .await
    {
        tracing::warn!(
            error.cause_chain = ?e,
            error.message = %e,
            "Failed to record newsletter consent attribute"
        );
    }
}

/// Best effort, like `tag_consent`
async fn add_to_newsletter_group(
    square_client: &SquareClient,
    customer_id: &CustomerId,
    group_id: &str,
) {
    if let Err(e) = square_client
        .add_group_to_customer(customer_id, group_id)
        .await
    {
        tracing::warn!(
            error.cause_chain = ?e,
            error.message = %e,
            "Failed to add customer to newsletter group"
        );
    }
}
