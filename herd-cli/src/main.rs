/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Supervise a pool of workers serving a line echo protocol

use anyhow::{Context, Error};
use clap::{Parser, Subcommand, ValueEnum};
use herd::component::{ComponentService, Connection, MessageComponent};
use herd::config::{Backend, SchedulerConfig};
use herd::ids::StreamId;
use herd::scheduler::Scheduler;
use herd::worker::{self, Service, ServiceFactory};
use herd_log::{LevelFilter, debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and serve until SIGTERM or SIGINT
    Run {
        /// JSON scheduler configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, value_enum)]
        backend: Option<BackendArg>,
        /// Address every worker accepts echo clients on
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,
    },
    /// Entry point of spawned workers
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        listen: SocketAddr,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Fork,
    Spawn,
    Thread,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Fork => Backend::Fork,
            BackendArg::Spawn => Backend::Spawn,
            BackendArg::Thread => Backend::Thread,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }

    fn as_arg(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Echoes every line back, `quit` ends the connection
#[derive(Default)]
struct EchoComponent {
    pending: HashMap<StreamId, Vec<u8>>,
}

impl MessageComponent for EchoComponent {
    fn on_open(&mut self, connection: &mut Connection) -> Result<(), herd::error::Error> {
        debug!("Echo client {} connected", connection.peer_addr());
        self.pending.insert(connection.id(), Vec::new());
        Ok(())
    }

    fn on_message(&mut self, connection: &mut Connection, bytes: &[u8]) -> Result<(), herd::error::Error> {
        let pending = self.pending.entry(connection.id()).or_default();
        pending.extend_from_slice(bytes);
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            if line.trim_ascii() == b"quit" {
                connection.close();
                return Ok(());
            }
            connection.write(&line);
        }
        Ok(())
    }

    fn on_close(&mut self, connection: &mut Connection) {
        self.pending.remove(&connection.id());
        debug!("Echo client {} left", connection.peer_addr());
    }

    fn on_error(&mut self, connection: &mut Connection, fault: &herd::error::Error) {
        warn!("Echo client {} failed: {fault}", connection.peer_addr());
    }
}

fn echo_service(listen: SocketAddr) -> ServiceFactory {
    Arc::new(move || Box::new(ComponentService::new(listen, EchoComponent::default())) as Box<dyn Service>)
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    herd_logger::init(cli.log_level.filter());

    match cli.command {
        Command::Run {
            config,
            backend,
            listen,
        } => run(config, backend, listen, cli.log_level),
        Command::Worker { listen } => {
            let code = worker::run_from_env(echo_service(listen)).context("worker failed")?;
            process::exit(code)
        },
    }
}

fn run(config: Option<PathBuf>, backend: Option<BackendArg>, listen: SocketAddr, level: LogLevel) -> Result<(), Error> {
    let mut config = match config {
        Some(path) => SchedulerConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    if let Some(backend) = backend {
        config.backend = backend.into();
    }
    config.spawn.args = vec![
        "--log-level".into(),
        level.as_arg().into(),
        "worker".into(),
        "--listen".into(),
        listen.to_string(),
    ];

    let mut scheduler = Scheduler::new(config, worker::entry(echo_service(listen)))?.handle_signals()?;
    info!(
        "Serving echo on {listen} with {:?} isolation",
        scheduler.capabilities().isolation
    );
    scheduler.run()?;
    Ok(())
}
