//! dualproc worker - hosts one processor and serves calls over stdin/stdout.

mod processors;

use clap::Parser;

#[derive(Parser)]
#[command(name = "dualproc-worker")]
#[command(about = "Worker process serving dualproc calls over stdin/stdout")]
#[command(version)]
struct Cli {
    /// Enable verbose logging (to stderr)
    #[arg(short, long)]
    verbose: bool,

    /// List the processors this worker can host and exit
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dualproc::logging::init_worker(cli.verbose);

    let registry = processors::registry();
    if cli.list {
        // Not a worker session, so stdout is free.
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    tracing::debug!(pid = std::process::id(), "worker started");
    dualproc::worker::run_worker(&registry)?;
    Ok(())
}
