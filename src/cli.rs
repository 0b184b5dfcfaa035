use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments.
pub fn parse_args() -> ArgMatches {
    Command::new("mbgw")
        .about("Modbus TCP to RTU gateway for a single RS-485 bus")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .short('s')
                .value_name("DEV")
                .help("Serial device, overrides rtu.port from the config"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .short('l')
                .value_name("ADDR")
                .help("Listen address as host:port, overrides the [tcp] section"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .help("List available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches()
}
