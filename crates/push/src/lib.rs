pub mod credentials;
pub mod fcm;

pub use credentials::{CredentialsError, ServiceAccountKey, ServiceAccountTokenSource, TokenSource};
pub use fcm::{
    http_client, DeliveryFailure, DeliveryReport, FcmClient, PushError, PushMessage, TokenOutcome,
    DEFAULT_REQUEST_TIMEOUT,
};
