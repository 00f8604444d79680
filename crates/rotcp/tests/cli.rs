use clap::Parser;
use rotcp::cli::Cli;

fn try_parse(args: &[&str]) -> Result<Cli, clap::Error> {
    Cli::try_parse_from(std::iter::once("rotcp").chain(args.iter().copied()))
}

#[test]
fn proxy_and_relay_are_mutually_exclusive() {
    let err = try_parse(&["--proxy", "--relay", "127.0.0.1:9000", "127.0.0.1:9001"]).unwrap_err();
    assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
}

#[test]
fn one_of_proxy_or_relay_is_required() {
    let err = try_parse(&["127.0.0.1:9000", "127.0.0.1:9001"]).unwrap_err();
    assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
}

#[test]
fn positionals_are_required() {
    let err = try_parse(&["--proxy"]).unwrap_err();
    assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
}

#[test]
fn debug_flag_is_repeatable_and_caps_at_three() {
    let cli = try_parse(&["--proxy", "-ddddd", "127.0.0.1:9000", "127.0.0.1:9001"]).unwrap();
    assert_eq!(cli.debug_level(), 3);
}

#[test]
fn defaults_match_the_historical_values() {
    let cli = try_parse(&["--relay", "127.0.0.1:9000", "127.0.0.1:9001"]).unwrap();
    assert_eq!(cli.listen, rotcp_core::ReactorConfig::DEFAULT_BACKLOG);
    assert_eq!(cli.connections, rotcp_core::ReactorConfig::DEFAULT_CONNECTIONS);
    assert_eq!(cli.debug_level(), 0);
}
