use limitometer::cli::{self, CliOptions};
use log::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli::build_cli().get_matches();
    let opts = CliOptions::from_matches(&matches);

    cli::init_logging(opts.log_level.as_deref());

    if opts.version {
        println!("limitometer version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Err(e) = limitometer::start(&opts).await {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
