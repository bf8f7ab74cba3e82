// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use lidr_net::{
    load_config_file, setup_local_tracing, setup_tracing, verbosity_level, Connection,
    EngineConfig, ListenerConfig, NetCallback, NetEngine, NetEvent, NetResult,
};
use tokio::runtime;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "LIDR echo server")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// write logs to this directory as well as stdout
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

/// Sends every frame back unchanged.
struct Echo;

impl NetCallback for Echo {
    fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()> {
        conn.send(frame)
    }

    fn on_event(&self, conn: &Connection, event: &NetEvent) {
        warn!(connection = %conn.handle(), "{}", event);
    }

    fn on_connected(&self, conn: &Connection) {
        info!(connection = %conn.handle(), remote = ?conn.remote_addr(), "client connected");
    }

    fn on_disconnected(&self, conn: &Connection) {
        info!(connection = %conn.handle(), "client disconnected");
    }
}

fn main() -> NetResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();

    let level = verbosity_level(commandline.verbose);
    let _tracing_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, level)?),
        None => {
            setup_local_tracing(level)?;
            None
        }
    };

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let source = load_config_file(&config_path)?;
    let engine_config = EngineConfig::from_source(&source)?;
    let listener_config = ListenerConfig::from_source(&source)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}\n{:#?}", engine_config, listener_config);
        return Ok(());
    }

    let engine = NetEngine::new(engine_config, Arc::new(Echo))?;
    engine.start()?;
    let listener = engine.create_listener(&listener_config, None)?;
    info!(addr = %engine.listener_addr(listener)?, "echo server ready");

    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async {
        let mut report = tokio::time::interval(Duration::from_secs(30));
        report.tick().await;
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!("waiting for ctrl-c failed: {}", err);
                    }
                    break;
                }
                _ = report.tick() => info!("{}", engine.stats()),
            }
        }
    });

    info!("shutting down");
    engine.destroy_listener(listener)?;
    engine.stop()?;
    Ok(())
}
