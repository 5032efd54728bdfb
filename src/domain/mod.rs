mod given_name;
mod new_subscriber;
mod subscriber_email;
pub use given_name::GivenName;
pub use new_subscriber::NewSubscriber;
pub use subscriber_email::SubscriberEmail;
