use clap::Parser;
use std::path::PathBuf;

use object_watcher::{Cli, Commands};

#[test]
fn test_watch_subcommand_takes_a_config_path() {
    let cli = Cli::try_parse_from(["object-watcher", "watch", "--config", "watcher.yaml"])
        .expect("should parse");
    let Commands::Watch { config } = cli.command;
    assert_eq!(config, PathBuf::from("watcher.yaml"));
}

#[test]
fn test_missing_config_flag_is_a_usage_error() {
    assert!(Cli::try_parse_from(["object-watcher", "watch"]).is_err());
    assert!(Cli::try_parse_from(["object-watcher"]).is_err());
}
