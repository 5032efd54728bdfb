/// Email address as submitted. Only presence is checked here; Square is the
/// authority on what counts as a valid address.
#[derive(Debug, Clone)]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    pub fn parse(email: String) -> Result<Self, String> {
        match email.is_empty() {
            false => Ok(Self(email)),
            true => Err("Email cannot be empty".to_string()),
        }
    }

    /// Lower-cased form, used for the exact-match customer search so that
    /// `Jo@Example.com` finds the customer created as `jo@example.com`
    pub fn search_key(&self) -> String { self.0.to_lowercase() }
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str { &self.0 }
}
