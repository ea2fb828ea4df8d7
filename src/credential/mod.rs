//! Access key management
//!
//! A key set by the user is persisted and takes precedence over the default
//! key supplied by the deployment.

mod store;

pub use store::{
    default_credential_path, CredentialError, CredentialStorage, CredentialStore,
    FileCredentialStorage, MemoryCredentialStorage,
};
