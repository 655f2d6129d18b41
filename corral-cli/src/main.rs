// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use corral_cli::CorralApp;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CORRAL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let app = CorralApp::parse();
    std::process::exit(app.exec())
}
