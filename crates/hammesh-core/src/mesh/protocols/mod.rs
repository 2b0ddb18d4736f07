//! Built-in protocols
//!
//! | Kind        | Protocol                         | Param         |
//! |-------------|----------------------------------|---------------|
//! | transport   | [`HmacTransport`]                | `H`           |
//! | transport   | [`ConfirmTransport`]             | `C` / `CO`    |
//! | application | [`PingApp`]                      | `PING`/`PONG` |
//! | application | [`RouteRequestApp`]              | `RREQ`/`RRSP` |
//! | application | [`SwitchApp`] (optional)         | `SW`          |
//! | modifier    | [`RelayMarker`]                  | `R`           |
//! | modifier    | [`RouteRequestModifier`]         | `RREQ`/`RRSP` |
//! | task        | [`BeaconTask`]                   |               |
//!
//! Registration order matters: transports see received packets in order
//! and outgoing packets in reverse order, so HMAC verifies before anything
//! else looks at a packet and signs after everything else has touched it.

pub mod beacon;
pub mod confirm;
pub mod hmac;
pub mod ping;
pub mod relay;
pub mod route_request;
pub mod switch;

pub use beacon::BeaconTask;
pub use confirm::ConfirmTransport;
pub use hmac::HmacTransport;
pub use ping::PingApp;
pub use relay::RelayMarker;
pub use route_request::{RouteRequestApp, RouteRequestModifier};
pub use switch::{MemorySwitch, SwitchApp, SwitchSweepTask, TransactionTable};

use super::network::Network;
use super::params::Params;
use super::traits::SwitchTarget;
use switch::SWEEP_INTERVAL_MS;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Register the standard protocol stack on `net`
pub fn install_builtins(net: &mut Network, switch: Option<Box<dyn SwitchTarget>>) {
    net.add_transport(Box::new(HmacTransport));
    net.add_transport(Box::new(ConfirmTransport));

    net.add_application(Box::new(PingApp));
    net.add_application(Box::new(RouteRequestApp));
    if let Some(target) = switch {
        let table = Rc::new(RefCell::new(TransactionTable::new()));
        let rng = StdRng::from_rng(net.rng_mut()).unwrap_or_else(|_| StdRng::from_entropy());
        net.add_application(Box::new(SwitchApp::new(target, table.clone(), rng)));
        net.schedule_task(
            SwitchSweepTask::new(table),
            Duration::from_millis(SWEEP_INTERVAL_MS),
        );
    }

    net.add_modifier(Box::new(RelayMarker));
    net.add_modifier(Box::new(RouteRequestModifier));

    beacon::schedule_first(net);
}

/// Parameter set holding a single naked key
pub(crate) fn naked(key: &str) -> Params {
    let mut params = Params::new();
    params.put_naked(key);
    params
}
