//! sshbuild - remote container builds over ssh

use clap::Parser;
use sshbuild_cli::{init_logging, run, Cli};

#[tokio::main]
async fn main() {
    // Usage errors exit here with clap's status 2, before any work starts.
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // `run` only returns once the scratch directory is gone and every child
    // process has been reaped.
    let code = run(cli).await;
    std::process::exit(code);
}
