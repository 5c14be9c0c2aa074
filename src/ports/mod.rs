//! External collaborator ports (SPEC_FULL.md §6, design note "cyclic
//! references"): the lifecycle controller depends on these traits, and
//! concrete providers depend on the traits too — never on the lifecycle
//! module — which is how the teacher's own cyclic provider/instance
//! coupling is avoided here.

pub mod callback;
pub mod codehost;
pub mod identity;
pub mod provider;

pub use callback::CallbackPort;
pub use codehost::CodeHostPort;
pub use identity::IdentityPort;
pub use provider::ProviderPort;

use std::sync::Arc;

use crate::crypto::EnvelopeCipher;

/// The GitHub App credentials needed to mint an installation token.
/// Bundled alongside the trait objects rather than threaded through
/// every call site individually — these three values never change for
/// the lifetime of the process.
#[derive(Clone, Default)]
pub struct IdentityConfig {
    pub app_id: String,
    pub private_key_pem: String,
    pub installation_id: String,
}

/// The external ports bundled for convenient threading through the
/// session actor and handlers, plus the process-wide envelope cipher
/// (SPEC_FULL.md §6 "Envelope encryption") every session needs to
/// decrypt host tokens at rest.
#[derive(Clone)]
pub struct Ports {
    pub provider: Arc<dyn ProviderPort>,
    pub codehost: Arc<dyn CodeHostPort>,
    pub identity: Arc<dyn IdentityPort>,
    pub callback: Arc<dyn CallbackPort>,
    pub identity_config: IdentityConfig,
    pub cipher: Arc<EnvelopeCipher>,
    /// Process-wide outbound-callback notification endpoint (spec.md §6
    /// "Outbound callbacks"). `None` disables completion notifications
    /// even when a message carries a `callback_context`.
    pub callback_url: Option<String>,
}
