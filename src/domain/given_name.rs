/// First name as typed by the visitor. Never empty; an empty name is not sent
/// to Square at all, so that an existing given name is not blanked.
#[derive(Debug, Clone)]
pub struct GivenName(String);

impl GivenName {
    pub fn parse(name: String) -> Result<Self, String> {
        match name.is_empty() {
            false => Ok(Self(name)),
            true => Err("Given name cannot be empty".to_string()),
        }
    }
}

impl AsRef<str> for GivenName {
    fn as_ref(&self) -> &str { &self.0 }
}
