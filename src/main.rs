// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The `tealtree` command line tool.

use clap::Parser;
use tealtree::{workflow, Options};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    registry::Registry,
};

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};
}

fn init_tracing(logging_severity: u32) {
    let level_filter = match logging_severity {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    };

    // Bridge log crate macros to tracing (the library logs through log::*)
    if tracing_log::LogTracer::init().is_err() {
        die!("{}", "INTERNAL ERROR: setting the log tracer failed");
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("TEALTREE_LOG")
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact(),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        die!("{}", "INTERNAL ERROR: setting default tracing subscriber failed");
    }

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing_panic::panic_hook(info);
        prev_hook(info); // daisy-chain to the old panic hook
    }));
}

fn main() {
    let options = Options::parse();
    init_tracing(options.logging_severity);

    if let Err(error) = workflow::run(options) {
        eprintln!("TealTree failed with exception: {error}");
        std::process::exit(1);
    }
}
