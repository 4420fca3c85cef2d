mod commands;
pub mod flags;
mod reporter;

use commands::*;
use structopt::StructOpt;
use tracing::{error, log};

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "sluice",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Versioned data pipelines over a local commit graph"
)]
struct Sluice {
    #[structopt(subcommand, help = "the command to run")]
    cmd: Command,
}

impl Sluice {
    async fn run(self) -> Result<(), anyhow::Error> {
        human_panic::setup_panic!(Metadata {
            name: "sluice".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            authors: "The Sluice Authors".into(),
            homepage: "".into(),
        });

        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Off)
            .format_timestamp_micros()
            .format_module_path(false)
            .parse_env("SLUICE_LOG")
            .try_init()?;

        let result = self.cmd.run().await;

        if let Err(ref err) = result {
            error!("{:?}", &err);
        };

        result
    }
}

#[derive(StructOpt, Debug, Clone)]
enum Command {
    Run(RunCommand),
    Validate(ValidateCommand),
}

impl Command {
    async fn run(self) -> Result<(), anyhow::Error> {
        match self {
            Command::Run(x) => x.run().await,
            Command::Validate(x) => x.run().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    Sluice::from_args().run().await
}
