//! Thin glue binary over the meta controller's HTTP API — argument-parsing
//! internals are out of scope here, so this is a direct `clap` → `reqwest`
//! translation with no logic of its own:
//! `gostreaming <address> {schemas|actions} {list|get|new|rm|run|stop}`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
struct Cli {
    /// Meta controller address, `host[:port]`.
    address: String,
    #[command(subcommand)]
    resource: Resource,
}

#[derive(Subcommand)]
enum Resource {
    Schemas {
        #[command(subcommand)]
        action: SchemeAction,
    },
    Actions {
        #[command(subcommand)]
        action: ActionVerb,
    },
}

#[derive(Subcommand)]
enum SchemeAction {
    List,
    Get { name: String },
    New { file: PathBuf },
    Rm { name: String },
    Run { name: String },
    Stop { name: String },
}

#[derive(Subcommand)]
enum ActionVerb {
    List,
    Get { name: String, #[arg(short, long)] out: Option<PathBuf> },
    New { name: String, file: PathBuf },
    Rm { name: String },
}

fn base_url(address: &str) -> String {
    if address.contains(':') {
        format!("http://{address}")
    } else {
        format!("http://{address}:7700")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let base = base_url(&cli.address);
    let http = reqwest::Client::new();

    match cli.resource {
        Resource::Schemas { action } => match action {
            SchemeAction::List => print_json(http.get(format!("{base}/v1/schemas")).send().await?).await?,
            SchemeAction::Get { name } => print_json(http.get(format!("{base}/v1/schemas/{name}")).send().await?).await?,
            SchemeAction::New { file } => {
                let body = tokio::fs::read_to_string(&file).await?;
                let scheme: gs_lang::Scheme = serde_json::from_str(&body)?;
                report(http.post(format!("{base}/v1/schemas")).json(&scheme).send().await?).await?
            }
            SchemeAction::Rm { name } => report(http.delete(format!("{base}/v1/schemas/{name}")).send().await?).await?,
            SchemeAction::Run { name } => report(http.put(format!("{base}/v1/schemas/{name}/run")).send().await?).await?,
            SchemeAction::Stop { name } => report(http.put(format!("{base}/v1/schemas/{name}/stop")).send().await?).await?,
        },
        Resource::Actions { action } => match action {
            ActionVerb::List => print_json(http.get(format!("{base}/v1/actions")).send().await?).await?,
            ActionVerb::Get { name, out } => {
                let response = http.get(format!("{base}/v1/actions/{name}")).send().await?;
                let bytes = response.bytes().await?;
                match out {
                    Some(path) => tokio::fs::write(path, &bytes).await?,
                    None => print!("{}", String::from_utf8_lossy(&bytes)),
                }
            }
            ActionVerb::New { name, file } => {
                let bytes = tokio::fs::read(&file).await?;
                let form = reqwest::multipart::Form::new().text("name", name).part("action", reqwest::multipart::Part::bytes(bytes));
                report(http.post(format!("{base}/v1/actions")).multipart(form).send().await?).await?
            }
            ActionVerb::Rm { name } => report(http.delete(format!("{base}/v1/actions/{name}")).send().await?).await?,
        },
    }

    Ok(())
}

async fn print_json(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        println!("{text}");
        Ok(())
    } else {
        anyhow::bail!("\x1b[31merror\x1b[0m: {status}: {text}")
    }
}

async fn report(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    if status.is_success() {
        println!("ok");
        Ok(())
    } else {
        let text = response.text().await?;
        anyhow::bail!("\x1b[31merror\x1b[0m: {status}: {text}")
    }
}
