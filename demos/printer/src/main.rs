//! Sink operator: logs every received payload and acks it. Mirrors
//! `original_source/examples/simplepipe/printer`, minus its TCP
//! broadcast-to-dashboard fan-out (out of scope here).

use gs_action::{ActionInput, ActionOutput};
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    loop {
        let Some(data) = ActionInput::read(&mut stdin).await? else {
            return Ok(());
        };
        match <[u8; 4]>::try_from(data.as_slice()) {
            Ok(bytes) => info!(value = u32::from_be_bytes(bytes), "printer: received"),
            Err(_) => info!(bytes = data.len(), "printer: received non-numeric payload"),
        }
        ActionOutput::ack_only(&mut stdout).await?;
    }
}
