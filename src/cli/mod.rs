pub mod config;
pub mod modbus;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::{collections::HashSet, sync::Arc};

use crate::{
    api::modbus::{
        master::MasterEngine,
        traits::{LoggingBridge, NoOpBridge, PropertyBridge},
    },
    core::stats::{spawn_reporter, Stats},
    homie::HomieBridge,
    protocol::transport,
};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use modbus::{prepare_master, prepare_slave, route_sets, start_master, start_slave};

/// Environment variable overriding the configured name and device id.
pub const NAME_ENV: &str = "NAME";

/// Build the command line definition.
pub fn build_command() -> Command {
    Command::new("homie-modbus")
        .about("Modbus master/slave simulator published as a Homie device")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .help("Path to the JSON configuration file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .short('s')
                .help("Log request/response counters every second")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

/// Reads the configuration named on the command line and applies `NAME`.
pub fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = AppConfig::from_file(path)?;
    config.apply_name_override(std::env::var(NAME_ENV).ok());
    Ok(config)
}

/// Runs the configured slave and master until SIGINT or SIGTERM.
pub async fn run(matches: &ArgMatches, config: AppConfig) -> Result<()> {
    let device_id = config.device_id();
    let slave_plan = config
        .slave
        .as_ref()
        .map(prepare_slave)
        .transpose()
        .context("Invalid slave configuration")?;
    let master_plan = config
        .master
        .as_ref()
        .map(prepare_master)
        .transpose()
        .context("Invalid master configuration")?;
    if let Some(plan) = &master_plan {
        MasterEngine::new(plan.groups.clone(), Arc::new(NoOpBridge::new()))
            .context("Invalid master configuration")?;
    }

    if matches.get_flag("check") {
        log::info!(
            "Configuration for '{}' is valid ({} slave fields, {} master transactions)",
            device_id,
            slave_plan.as_ref().map_or(0, |plan| plan.fields.len()),
            master_plan.as_ref().map_or(0, |plan| plan.groups.len())
        );
        return Ok(());
    }
    if slave_plan.is_none() && master_plan.is_none() {
        log::warn!("Neither slave nor master is configured, nothing to do");
        return Ok(());
    }

    let homie = match &config.mqtt {
        Some(mqtt) => Some(Arc::new(HomieBridge::connect(mqtt, &device_id, &config.name)?)),
        None => {
            log::info!("No MQTT broker configured, values are only logged");
            None
        }
    };
    let bridge: Arc<dyn PropertyBridge> = match &homie {
        Some(homie) => homie.clone() as Arc<dyn PropertyBridge>,
        None => Arc::new(LoggingBridge::new()),
    };

    let slave_nodes: HashSet<String> = slave_plan
        .iter()
        .flat_map(|plan| plan.fields.iter().map(|field| field.node_id.clone()))
        .collect();
    let (slave_sets, master_sets) = route_sets(bridge.set_events(), slave_nodes);

    let stats_enabled = matches.get_flag("stats") || config.stats_enabled();
    let mut reporters = Vec::new();

    let slave = match slave_plan {
        Some(plan) => {
            let stats = Arc::new(Stats::default());
            if stats_enabled {
                reporters.push(spawn_reporter("slave", stats.clone()));
            }
            Some(start_slave(plan, bridge.clone(), slave_sets, stats)?)
        }
        None => None,
    };

    let master = match (master_plan, &config.master) {
        (Some(plan), Some(master_config)) => {
            let mut engine = MasterEngine::new(plan.groups, bridge.clone())?;
            engine.advertise()?;
            let client =
                transport::connect_client(&plan.endpoint, master_config.concurrent_transactions)
                    .await?;
            let stats = Arc::new(Stats::default());
            if stats_enabled {
                reporters.push(spawn_reporter("master", stats.clone()));
            }
            Some(start_master(engine, client, master_sets, stats))
        }
        _ => None,
    };

    if let Some(homie) = &homie {
        homie.ready();
    }
    log::info!("Device '{device_id}' running");

    wait_for_signal().await?;
    log::info!("Shutting down");

    for reporter in reporters {
        reporter.abort();
    }
    if let Some(master) = master {
        master.shutdown().await;
    }
    if let Some(slave) = slave {
        slave.shutdown().await;
    }
    if let Some(homie) = &homie {
        homie.disconnect().await;
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => log::debug!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
