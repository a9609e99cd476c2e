use clap::Parser;
use dexsup::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = cli::execute(cli).await;

    // Exit explicitly: the stdin reader of a worker would otherwise keep the
    // runtime from shutting down.
    std::process::exit(code);
}
