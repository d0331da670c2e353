use clap::Parser;
use originproxy_bin::run;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/originproxy/config.yaml")]
    config: PathBuf,

    /// Overrides the TLS certificate cache directory; only takes effect if
    /// the config file leaves `tls_dir` unset.
    #[arg(short = 'd', long)]
    tls_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let tls_dir = args.tls_dir.map(|p| p.to_string_lossy().into_owned());
    run(&args.config, tls_dir).await
}
