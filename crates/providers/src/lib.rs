pub mod boldsign;
pub mod mailer;
pub mod oauth;
pub mod object_store;

pub use boldsign::{BoldSignClient, DocumentProperties, ProviderError};
pub use mailer::{EmailError, EmailMessage, EmailTransport, ResendTransport};
pub use oauth::{
    ClientCredentialsTokenProvider, OAuthError, StaticTokenProvider, TokenCache, TokenProvider,
    TokenResponse,
};
pub use object_store::{ObjectStoreClient, ObjectStoreError};
