use clap::Parser;
use tokio::net::TcpListener;

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    #[arg(long, default_value_t = 1337)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let address = std::env::var("BIND_HOST").unwrap_or(args.address);

    let listener = TcpListener::bind(format!("{address}:{}", args.port)).await?;
    speed_daemon::run(listener).await?;

    Ok(())
}
