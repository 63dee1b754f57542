use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Sandbox, SandboxIdentity};
use crate::RuntimeError;

/// Shells out to `useradd`/`userdel` for the throwaway identity and `nft`
/// for the outbound allowlist, matching the original Go runtime's approach
/// of delegating to system tools rather than reimplementing user/netfilter
/// management in-process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSandbox;

fn nft_chain_name(name: &str) -> String {
    let sanitized: String = name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    format!("gs_{sanitized}")
}

async fn run(cmd: &str, args: &[&str]) -> Result<(), RuntimeError> {
    let output = Command::new(cmd).args(args).output().await.map_err(|e| RuntimeError::Sandbox(format!("{cmd}: {e}")))?;
    if !output.status.success() {
        return Err(RuntimeError::Sandbox(format!(
            "{cmd} {args:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[async_trait]
impl Sandbox for LinuxSandbox {
    async fn create(&self, name: &str, allowlist: &[String]) -> Result<SandboxIdentity, RuntimeError> {
        let username = format!("gs_{}", nft_chain_name(name));
        run("useradd", &["--system", "--no-create-home", "--shell", "/usr/sbin/nologin", &username]).await?;

        let uid_out = Command::new("id").args(["-u", &username]).output().await.map_err(|e| RuntimeError::Sandbox(e.to_string()))?;
        let gid_out = Command::new("id").args(["-g", &username]).output().await.map_err(|e| RuntimeError::Sandbox(e.to_string()))?;
        let uid: u32 = String::from_utf8_lossy(&uid_out.stdout).trim().parse().map_err(|e| RuntimeError::Sandbox(format!("parsing uid: {e}")))?;
        let gid: u32 = String::from_utf8_lossy(&gid_out.stdout).trim().parse().map_err(|e| RuntimeError::Sandbox(format!("parsing gid: {e}")))?;

        let chain = nft_chain_name(name);
        run("nft", &["add", "chain", "inet", "filter", &chain, "{ type filter hook output priority 0 ; }"]).await?;
        for addr in allowlist {
            run("nft", &["add", "rule", "inet", "filter", &chain, "meta", "skuid", &uid.to_string(), "ip", "daddr", addr, "accept"]).await?;
        }
        run("nft", &["add", "rule", "inet", "filter", &chain, "meta", "skuid", &uid.to_string(), "drop"]).await?;

        info!(username, uid, gid, chain, "sandbox: identity and firewall chain created");
        Ok(SandboxIdentity { uid, gid, username })
    }

    async fn destroy(&self, identity: &SandboxIdentity) -> Result<(), RuntimeError> {
        let chain = nft_chain_name(&identity.username);
        let firewall_result = run("nft", &["delete", "chain", "inet", "filter", &chain]).await;
        let user_result = run("userdel", &[&identity.username]).await;
        if let Err(err) = &firewall_result {
            warn!(%err, chain, "sandbox: firewall chain teardown failed");
        }
        if let Err(err) = &user_result {
            warn!(%err, username = %identity.username, "sandbox: user deletion failed");
        }
        firewall_result.and(user_result)
    }
}
