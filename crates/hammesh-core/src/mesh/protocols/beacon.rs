//! Periodic station beacon
//!
//! Announces the station and its uptime to `QB`, or to `QR` when the node is
//! a repeater so that other stations learn it relays. The interval is read
//! from the store on every run, so a changed setting takes effect at the
//! next beacon.

use crate::config::{NodeSettings, BEACON_MAX_SECS};
use crate::mesh::callsign::Callsign;
use crate::mesh::network::Network;
use crate::mesh::params::Params;
use crate::mesh::routing::fudge_ms;
use crate::scheduler::{Reschedule, Task};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Beacon message for a given uptime
pub fn beacon_message(uptime_ms: u64) -> String {
    format!("LoRaMaDoR {} 73", uptime_ms / 1000)
}

/// Sends the beacon and reschedules itself
#[derive(Debug, Default)]
pub struct BeaconTask;

impl Task<Network> for BeaconTask {
    fn name(&self) -> &str {
        "beacon"
    }

    fn run(&mut self, net: &mut Network, _now: u64) -> Reschedule {
        let Some(interval) = net.store().beacon_interval() else {
            debug!("beacon disabled");
            return Reschedule::After(Duration::from_secs(BEACON_MAX_SECS));
        };

        let to = if net.is_repeater() {
            Callsign::repeater_broadcast()
        } else {
            Callsign::broadcast()
        };
        let msg = beacon_message(net.uptime_ms());
        match net.send(to, Params::new(), msg) {
            Ok(id) => info!("beacon #{}", id),
            Err(e) => warn!("beacon not sent: {}", e),
        }

        let next = fudge_ms(net.rng_mut(), interval.as_millis() as u64, 0.5);
        Reschedule::After(Duration::from_millis(next))
    }
}

/// Queue the first beacon, sooner than the regular interval
pub(crate) fn schedule_first(net: &mut Network) {
    let avg = net.store().first_beacon_delay().as_millis() as u64;
    let first = fudge_ms(net.rng_mut(), avg, 0.5);
    debug!("first beacon in {} ms", first);
    net.schedule_task(BeaconTask, Duration::from_millis(first));
}
