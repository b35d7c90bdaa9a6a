use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Config {
    /// websocket listen address for participants
    #[clap(long, value_parser, default_value = "127.0.0.1:9090")]
    pub listen: String,

    /// http listen address for the read-only peers endpoint
    #[clap(long, value_parser, default_value = "127.0.0.1:9091")]
    pub observer: String,
}

impl Config {
    pub fn new() -> Config {
        Config::parse()
    }
}
