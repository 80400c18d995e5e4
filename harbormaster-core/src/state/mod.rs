//! State Store component: persisted project/host records.

mod store;
mod types;

pub use store::StateStore;
pub use types::{
    CertStatusKind, CertificateStatus, Document, Host, LetsEncryptConfig, Metadata, Project,
    DEFAULT_MAX_ATTEMPTS,
};
