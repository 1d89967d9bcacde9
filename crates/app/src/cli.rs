use std::ffi::OsString;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::hub::{
    self,
    config::{HubCliArgs, HubConfig, PublishCliArgs, PublishConfig},
};

#[derive(Debug, Parser)]
#[command(name = "frame-hub", version, about = "Live camera frame hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept frames from publishers and serve them to viewers.
    Serve(HubCliArgs),
    /// Push frames from a video source to a running hub.
    Publish(PublishCliArgs),
}

pub fn handle_commands<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::parse_from(args).command {
        Command::Serve(args) => hub::serve(HubConfig::try_from(args)?),
        Command::Publish(args) => hub::publisher::run(PublishConfig::try_from(args)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_and_publish() {
        let cli = Cli::try_parse_from(["frame-hub", "serve", "--frame-skip", "5"]).unwrap();
        assert!(matches!(cli.command, Command::Serve(ref args) if args.frame_skip == 5));

        let cli = Cli::try_parse_from([
            "frame-hub",
            "publish",
            "porch",
            "rtsp://10.0.0.9/stream",
            "--hub",
            "hub.local:5555",
        ])
        .unwrap();
        match cli.command {
            Command::Publish(args) => {
                let config = PublishConfig::try_from(args).unwrap();
                assert_eq!(config.camera_id, "porch");
                assert_eq!(config.hub_addr, "hub.local:5555");
                assert!(config.jpeg_quality.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["frame-hub"]).is_err());
    }
}
