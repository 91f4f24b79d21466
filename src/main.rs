//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd::engine::Engine;
use bfdd::sink::LogSink;
use clap::{App, Arg};
use itertools::Itertools;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

const DFLT_CONFIG_FILE: &str = "/etc/bfdd.conf";

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("bfdd=debug".parse().unwrap())
        .from_env_lossy();
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

fn load_config(path: &str) -> Vec<(String, bfdd::session::SessionConfig)> {
    let input = std::fs::read_to_string(path).unwrap_or_else(|error| {
        error!(%path, %error, "failed to read configuration file");
        std::process::exit(1);
    });
    bfdd::config::parse(&input)
}

fn main() {
    // Parse command-line parameters.
    let matches = App::new("BFD daemon")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    let config_file = matches.value_of("config").unwrap_or(DFLT_CONFIG_FILE);

    init_tracing();

    let configs = load_config(config_file);
    info!(
        uid = nix::unistd::Uid::current().as_raw(),
        instances = %configs.iter().map(|(name, _)| name.as_str()).join(", "),
        "starting up"
    );

    // Abort the process rather than leave a half-initialized engine
    // running if any task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // The engine is single-threaded by design (SPEC_FULL.md §5): every
    // session transition happens inline on one stack, so a current-thread
    // runtime is sufficient and avoids any cross-thread synchronization
    // the protocol state itself never needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime");

    runtime.block_on(async {
        let mut engine = match Engine::new(configs, Box::new(LogSink)) {
            Ok(engine) => engine,
            Err(error) => {
                error!(%error, "failed to initialize engine");
                std::process::exit(1);
            }
        };
        engine.run().await;
    });
}
