use clap::Parser;

use osi_visualizer::capture::PcapSource;
use osi_visualizer::utils::{config::Config, logger};

/// Packet capture backend serving OSI-annotated packets over HTTP
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file (.json or .toml), tried before the default locations
    #[arg(short, long)]
    config: Option<String>,

    /// Network interface to capture on ("default" for the libpcap default device)
    #[arg(short, long)]
    interface: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Print the available capture interfaces and exit
    #[arg(short, long)]
    list_interfaces: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_interfaces {
        for device in PcapSource::list_interfaces()? {
            match device.desc {
                Some(desc) => println!("{}\t{}", device.name, desc),
                None => println!("{}", device.name),
            }
        }
        return Ok(());
    }

    // Environment log settings apply until the configuration is loaded
    dotenv::dotenv().ok();
    let log = logger::init()?;

    let mut cfg = Config::load_from(cli.config.as_deref())?;
    if let Some(interface) = cli.interface {
        cfg.network_interface = interface;
    }
    if let Some(host) = cli.host {
        cfg.server_host = host;
    }
    if let Some(port) = cli.port {
        cfg.server_port = port;
    }
    cfg.validate()?;

    log.set_level(&cfg.log_level);
    if let Some(log_file) = &cfg.log_file {
        if std::env::var("LOG_FILE").ok().as_deref() != Some(log_file.as_str()) {
            log.redirect_to_file(log_file)?;
        }
    }

    osi_visualizer::start_blocking(cfg)?;
    Ok(())
}
