//! Dynamic interface manager.
//!
//! Every scan interval the manager re-derives the capture plan, diffs it
//! against the previous snapshot, and applies only the changes: new
//! interfaces get a live handle plus a reader thread, existing handles get
//! their BPF filter recompiled in place. Handles live until process end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pcap::{Active, Capture};
use ps_config::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bpf::{self, SystemResolver};
use crate::interface;
use crate::plan;
use crate::reader;
use crate::CaptureError;

/// How often the capture plan is recomputed.
pub const PROCESS_SCAN_FREQUENCY: Duration = Duration::from_secs(10);

/// Run the interface manager until the stop token fires.
///
/// Failing to open an interface or to compile its initial filter is fatal:
/// the sensor does not run in a partial-capture mode. Transient failures
/// while enumerating interfaces only skip one scan.
pub async fn run(
    config: Arc<Config>,
    gather_tx: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
) -> Result<(), CaptureError> {
    let resolver = SystemResolver;
    let mut handles: HashMap<String, Arc<Mutex<Capture<Active>>>> = HashMap::new();
    let mut prev_plan: HashMap<String, Vec<u16>> = HashMap::new();
    let mut ticker = tokio::time::interval(PROCESS_SCAN_FREQUENCY);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let up = match interface::up_interfaces() {
            Ok(up) => up,
            Err(e) => {
                log::warn!("Unable to enumerate interfaces: {}", e);
                continue;
            }
        };

        let new_plan = plan::derive_plan(
            config.pcap_mode,
            &config.capture_ports,
            &config.capture_interfaces_ports,
            &up,
        );

        for (name, ports) in plan::diff_plans(&prev_plan, &new_plan) {
            apply_change(&config, &resolver, &mut handles, &gather_tx, &stop, name, ports).await?;
        }
        prev_plan = new_plan;
    }

    Ok(())
}

async fn apply_change(
    config: &Arc<Config>,
    resolver: &SystemResolver,
    handles: &mut HashMap<String, Arc<Mutex<Capture<Active>>>>,
    gather_tx: &mpsc::Sender<Vec<u8>>,
    stop: &CancellationToken,
    name: String,
    ports: Vec<u16>,
) -> Result<(), CaptureError> {
    let server = server_endpoint(config);
    let filter = bpf::create_bpf_string(
        config.pcap_mode,
        server.as_ref().map(|(addr, port)| (addr.as_str(), *port)),
        resolver,
        &ports,
    )
    .await?;

    match handles.get(&name) {
        Some(handle) => {
            // Filter update on a handle that is concurrently being read;
            // the reader and the manager share the handle mutex.
            if !filter.is_empty() {
                log::info!("Existing interface {} updated with: {}", name, filter);
                let mut capture = match handle.lock() {
                    Ok(capture) => capture,
                    Err(_) => {
                        return Err(CaptureError::Capture(format!(
                            "capture handle lock poisoned on {}",
                            name
                        )))
                    }
                };
                if let Err(e) = capture.filter(&filter, true) {
                    log::error!("Could not update filter on {}: {}", name, e);
                }
            }
        }
        None => {
            let mut capture = interface::open_interface(&name, config.input_packet_len as i32)?;
            if !filter.is_empty() {
                capture
                    .filter(&filter, true)
                    .map_err(|e| CaptureError::BadFilter(filter.clone(), e.to_string()))?;
            }
            let handle = Arc::new(Mutex::new(capture));
            handles.insert(name.clone(), handle.clone());
            reader::spawn_reader(
                name.clone(),
                handle,
                config.sampling_rate,
                gather_tx.clone(),
                stop.child_token(),
            );
            log::info!("New interface setup: {}", name);
        }
    }

    Ok(())
}

fn server_endpoint(config: &Config) -> Option<(String, u16)> {
    let server = config.output.server.as_ref()?;
    let port = server.port?;
    Some((server.address.clone(), port))
}
