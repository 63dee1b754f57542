use async_trait::async_trait;

use super::{Sandbox, SandboxIdentity};
use crate::RuntimeError;

/// No-op sandbox: runs the child under the supervisor's own credentials
/// with no firewall isolation. Used in tests and on non-Linux builds where
/// `useradd`/`nft` aren't available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSandbox;

#[async_trait]
impl Sandbox for NullSandbox {
    async fn create(&self, _name: &str, _allowlist: &[String]) -> Result<SandboxIdentity, RuntimeError> {
        Ok(SandboxIdentity { uid: nix::unistd::getuid().as_raw(), gid: nix::unistd::getgid().as_raw(), username: "null-sandbox".to_string() })
    }

    async fn destroy(&self, _identity: &SandboxIdentity) -> Result<(), RuntimeError> {
        Ok(())
    }
}
