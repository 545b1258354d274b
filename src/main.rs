use anyhow::Result;
use sprot::config::{Cli, Config};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(&cli)?;
    sprot::run(cli, config)
}
