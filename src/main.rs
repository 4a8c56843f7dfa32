use clap::Parser;
use ociproxd::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = ociproxd::run(cli).await;
    std::process::exit(code);
}
