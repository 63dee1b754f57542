//! Source operator: emits an incrementing `u32` counter every `--freq`
//! milliseconds. Mirrors `original_source/examples/simplepipe/num_gen`.

use clap::Parser;
use gs_action::ActionOutput;

#[derive(Parser)]
struct Args {
    /// Delay between messages, in milliseconds.
    #[arg(long, default_value_t = 100)]
    freq: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let mut stdout = tokio::io::stdout();
    let mut n: u32 = 1;
    loop {
        ActionOutput::write(&mut stdout, &n.to_be_bytes()).await?;
        n = n.wrapping_add(1);
        tokio::time::sleep(std::time::Duration::from_millis(args.freq)).await;
    }
}
