use anyhow::{Context, Result};
use std::sync::atomic::Ordering;

use mbgw::boot;
use mbgw::cli;
use mbgw::config::GatewayConfig;
use mbgw::gateway::link::SerialOpener;
use mbgw::gateway::server::Server;
use mbgw::utils::ports::enumerate_ports;

fn main() -> Result<()> {
    boot::init_logging();
    let matches = cli::parse_args();

    if matches.get_flag("list-ports") {
        for (name, kind) in enumerate_ports() {
            println!("{name}\t{kind}");
        }
        return Ok(());
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(dev) = matches.get_one::<String>("serial") {
        config.rtu.port = dev.clone();
    }
    if let Some(addr) = matches.get_one::<String>("listen") {
        apply_listen_override(&mut config, addr)?;
    }

    log::info!(
        "Bridging {} <-> {} ({} baud)",
        config.listen_addr(),
        config.rtu.port,
        config.rtu.baud
    );

    let opener = SerialOpener::new(config.rtu.clone());
    let server = Server::bind(config, Box::new(opener))?;

    let stop = server.shutdown_flag();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, shutting down");
        stop.store(true, Ordering::Relaxed);
    })
    .context("Installing interrupt handler")?;

    server.run()
}

fn apply_listen_override(config: &mut GatewayConfig, addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("Listen address '{addr}' must be host:port"))?;
    config.tcp.host = host.to_string();
    config.tcp.port = port
        .parse()
        .with_context(|| format!("Invalid port in listen address '{addr}'"))?;
    Ok(())
}
