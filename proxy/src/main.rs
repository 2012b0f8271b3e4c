use anyhow::Result;
use clap::Parser;
use clarity_proxy::Args;
use clarity_proxy::Proxy;
use tracing::Level;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbosity);

    let proxy = Proxy::new(&args)?;
    let handle = proxy.run().await?;

    tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            // Listeners are aborted as soon as the wait future is dropped;
            // in-flight connection tasks get a short grace window to finish.
            info!("interrupt received; shutting down");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Ok(())
        }
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}
