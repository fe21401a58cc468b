// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use session::{FilePersister, MemoryPersister, Persister};
use shrike::config::LogLevel;
use shrike::{Broker, Config, Error};

#[derive(Debug, Parser)]
#[command(name = "shrike", about = "MQTT 3.1.1 pub/sub broker", version)]
struct Arguments {
    /// Path to the config file. Without one, a plain-TCP listener on
    /// 0.0.0.0:1883 with in-memory state is started.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn init_log(level: LogLevel) {
    let filter = match level {
        LogLevel::Off => log::LevelFilter::Off,
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Trace => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let arguments = Arguments::parse();
    let config = match &arguments.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_log(config.log.level());

    let persister: Arc<dyn Persister> = match config.general.storage_dir() {
        Some(dir) => Arc::new(FilePersister::new(dir)),
        None => Arc::new(MemoryPersister::new()),
    };

    let broker = Broker::with_connect_timeout(persister, config.general.connect_timeout());
    broker.run(&config).await
}
