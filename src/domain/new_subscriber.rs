use super::GivenName;
use super::SubscriberEmail;

/// A visitor who has asked for the newsletter and given marketing consent.
/// There is no way to build one without consent.
#[derive(Debug)]
pub struct NewSubscriber {
    pub given_name: Option<GivenName>,
    pub email: SubscriberEmail,
}
