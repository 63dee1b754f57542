//! Throwaway-identity isolation for a runtime's child process.
//!
//! On start, a runtime gets a throwaway local user identity and a
//! firewall chain restricting that identity's outbound network to a
//! declared allowlist; failure to create either is fatal to runtime
//! start. [`LinuxSandbox`] shells out to `useradd`/`iptables`-style
//! helpers rather than reimplementing user and netfilter management.

mod linux;
mod null;

pub use linux::LinuxSandbox;
pub use null::NullSandbox;

use async_trait::async_trait;

use crate::RuntimeError;

/// The throwaway identity created for one runtime's lifetime.
#[derive(Debug, Clone)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Creates the identity and installs its firewall allowlist. `name` is
    /// used to derive the throwaway username (so it's traceable to the
    /// runtime in `ps`/audit output).
    async fn create(&self, name: &str, allowlist: &[String]) -> Result<SandboxIdentity, RuntimeError>;

    /// Tears down the firewall chain and deletes the identity. Best-effort
    /// past the first failure: both steps are attempted even if one errors,
    /// and the first error is returned.
    async fn destroy(&self, identity: &SandboxIdentity) -> Result<(), RuntimeError>;
}
