//! Passes messages whose `u32` value is a multiple of `--mod`, acking the
//! rest unchanged without forwarding it.

use clap::Parser;
use gs_action::run_loop;

#[derive(Parser)]
struct Args {
    /// Passes messages that are multiples of `mod`.
    #[arg(long = "mod", default_value_t = 1)]
    modulus: u32,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    run_loop(move |data| {
        let number = u32::from_be_bytes(data.as_slice().try_into().ok()?);
        (number % args.modulus == 0).then_some(data)
    })
    .await
}
