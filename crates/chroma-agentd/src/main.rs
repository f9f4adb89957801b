use clap::Parser;
use tracing::error;

use chroma_agentd::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match chroma_agentd::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format_args!("{e:#}"), "chroma-agent failed");
            eprintln!("chroma-agent: {e:#}");
            chroma_agentd::exit_code(&e)
        }
    };
    std::process::exit(code);
}
