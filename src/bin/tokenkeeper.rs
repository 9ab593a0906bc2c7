extern crate tokenkeeper;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tokenkeeper::client::TokenAccessClient;
use tokenkeeper::config::Config;
use tokenkeeper::constants::{
    TOKENKEEPER_DEFAULT_CONFIG_FILE, TOKENKEEPER_ENV_CONFIG,
};
use tokenkeeper::daemon::start::start_tokenkeeper_daemon;
use tokenkeeper::token::TokenAccess;

/// Gives tenants shared access to keys on PKCS#11 tokens.
#[derive(clap::Parser)]
#[command(version)]
struct Options {
    /// Override the path to the config file
    #[arg(
        short, long,
        env = TOKENKEEPER_ENV_CONFIG,
        default_value = TOKENKEEPER_DEFAULT_CONFIG_FILE,
        value_name = "path",
    )]
    config: PathBuf,
}

fn main() {
    let options = Options::parse();

    let config = match Config::parse(&options.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not parse config: {e}");
            ::std::process::exit(1);
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("{e}");
        ::std::process::exit(1);
    }

    // Token libraries read their environment when they are loaded, and
    // setting variables is only sound while we have a single thread.
    config.token_access.export_environment();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start runtime: {e}");
            ::std::process::exit(1);
        }
    };

    let access = Arc::new(TokenAccess::from_config(config.token_access.clone()));
    let res = runtime.block_on(start_tokenkeeper_daemon(
        Arc::new(config),
        TokenAccessClient::local(access),
        None,
    ));
    if let Err(e) = res {
        eprintln!("Tokenkeeper stopped: {e}");
        ::std::process::exit(1);
    }
}
