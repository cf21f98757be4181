#![warn(clippy::pedantic)]

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_std::sync::Mutex;
use async_std::task;
use chrono::Local;
use log::{error, info};

use cavity_retreat::communications::{CommandServer, Telemetry, ZmqReplyChannel};
use cavity_retreat::configs;
use cavity_retreat::controller::Controller;
use cavity_retreat::scheduler::{interrupt_handler, poll_signal, Scheduler};
use cavity_retreat::util::find_file;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(buf, "[{}] {} {}", Local::now(), record.level(), record.args())
        })
        .init();

    let path = match env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => find_file(Path::new("config.toml"))
            .ok_or_else(|| anyhow!("no config.toml next to the working directory or executable"))?,
    };
    info!("reading config file {}", path.display());
    let cfg = configs::load(&path).with_context(|| format!("failed to load {}", path.display()))?;

    let ctrl = Controller::new(configs::controller_from_config(&cfg)?)
        .ok_or_else(|| anyhow!("failed to allocate the controller logs"))?;
    let shared = Arc::new(Mutex::new(ctrl));
    let stop = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(interrupt_handler(Arc::clone(&stop)))
        .context("failed to install the interrupt handler")?;

    let (source, sink) =
        configs::hardware_from_config(&cfg).context("failed to set up the hardware")?;
    let comms = configs::comms_from_config(&cfg);
    let channel = ZmqReplyChannel::bind(&comms.command_endpoint).await?;
    let telemetry = match &comms.telemetry_endpoint {
        Some(endpoint) => Some(Telemetry::bind(endpoint, comms.publish_every).await?),
        None => None,
    };

    let poller = task::spawn(poll_signal(
        source,
        Arc::clone(&shared),
        Arc::clone(&stop),
        configs::signal_retry_from_config(&cfg),
    ));
    let server = CommandServer::new(channel, Arc::clone(&shared), Arc::clone(&stop))
        .with_poll_interval(comms.poll_interval);
    let server_stop = Arc::clone(&stop);
    let server = task::spawn(async move {
        if let Err(e) = server.serve().await {
            error!("command server failed: {e}; ramping down");
            server_stop.store(true, Ordering::Relaxed);
        }
    });

    Scheduler::new(
        shared,
        sink,
        telemetry,
        stop,
        configs::scheduler_from_config(&cfg),
    )
    .run()
    .await;
    server.await;
    poller.await;
    info!("outputs at zero, exiting");
    Ok(())
}
