//! Remote switch control (`SW` param)
//!
//! A confirmed, replay-resistant command exchange. Every message is a comma
//! separated list:
//!
//! ```text
//! client → server   A,challenge
//! server → client   B,challenge,response
//! client → server   C,challenge,response,target,value
//! server → client   D,challenge,response,target,state
//! ```
//!
//! The server keys transactions on `(client, challenge)`. A retransmitted
//! `A` gets the same response back; a retransmitted `C` gets the stored `D`
//! and the command is not applied again. Transactions are kept for
//! [`TRANSACTION_TTL_MS`] after their last use, then swept.
//!
//! Replay protection relies on the packets being authenticated. Requests are
//! served only when an HMAC key is configured and their `H` tag verifies,
//! whatever transports run ahead of this handler.

use super::naked;
use crate::mesh::callsign::Callsign;
use crate::mesh::crypto::verify_hmac;
use crate::mesh::network::Network;
use crate::mesh::packet::Packet;
use crate::mesh::traits::{Application, ProtocolContext, Reply, SwitchTarget};
use crate::scheduler::{Reschedule, Task};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};

pub const PARAM: &str = "SW";
pub const MIN_CHALLENGE_LEN: usize = 8;
pub const RESPONSE_LEN: usize = 8;
pub const TRANSACTION_TTL_MS: u64 = 2 * 60 * 1000;
pub const SWEEP_INTERVAL_MS: u64 = 30 * 1000;

/// Value meaning "report the state, change nothing"
pub const QUERY: &str = "?";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transaction {
    response: String,
    expires_at: u64,
    /// `D` message, once the command was carried out
    confirmation: Option<String>,
}

/// Open switch transactions
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: HashMap<(Callsign, String), Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response token for a challenge, allocating one for a new transaction
    fn open<R: Rng>(&mut self, from: &Callsign, challenge: &str, now: u64, rng: &mut R) -> String {
        let tx = self
            .entries
            .entry((from.clone(), challenge.to_string()))
            .or_insert_with(|| Transaction {
                response: (0..RESPONSE_LEN)
                    .map(|_| char::from(rng.sample(Alphanumeric)))
                    .collect(),
                expires_at: 0,
                confirmation: None,
            });
        tx.expires_at = now + TRANSACTION_TTL_MS;
        tx.response.clone()
    }

    fn get_mut(&mut self, from: &Callsign, challenge: &str) -> Option<&mut Transaction> {
        self.entries.get_mut(&(from.clone(), challenge.to_string()))
    }

    /// Drop expired transactions, returning how many went away
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, tx| tx.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server side of the switch protocol
pub struct SwitchApp {
    target: Box<dyn SwitchTarget>,
    table: Rc<RefCell<TransactionTable>>,
    rng: StdRng,
}

impl SwitchApp {
    pub fn new(
        target: Box<dyn SwitchTarget>,
        table: Rc<RefCell<TransactionTable>>,
        rng: StdRng,
    ) -> Self {
        Self { target, table, rng }
    }

    fn challenge(&mut self, from: &Callsign, challenge: &str, now: u64) -> Option<String> {
        if challenge.len() < MIN_CHALLENGE_LEN {
            debug!("SW challenge too short from {}", from);
            return None;
        }
        let response = self
            .table
            .borrow_mut()
            .open(from, challenge, now, &mut self.rng);
        Some(format!("B,{},{}", challenge, response))
    }

    fn command(
        &mut self,
        from: &Callsign,
        challenge: &str,
        response: &str,
        target: &str,
        value: &str,
        now: u64,
    ) -> Option<String> {
        let mut table = self.table.borrow_mut();
        let Some(tx) = table.get_mut(from, challenge) else {
            debug!("SW type C unknown challenge from {}", from);
            return None;
        };
        if tx.response != response {
            debug!("SW type C mismatched response from {}", from);
            return None;
        }
        tx.expires_at = now + TRANSACTION_TTL_MS;

        if let Some(confirmation) = &tx.confirmation {
            debug!("SW type C retransmission from {}", from);
            return Some(confirmation.clone());
        }

        let state = if value == QUERY {
            self.target.query(target)
        } else {
            self.target.apply(target, value)
        };
        let Some(state) = state else {
            debug!("SW unknown target {}", target);
            return None;
        };
        if value != QUERY {
            info!("switch {} set to {} by {}", target, state, from);
        }

        let confirmation = format!("D,{},{},{},{}", challenge, response, target, state);
        tx.confirmation = Some(confirmation.clone());
        Some(confirmation)
    }
}

/// Whether `packet` carries a valid tag under the key for its sender
fn authenticated(ctx: &ProtocolContext<'_>, packet: &Packet) -> bool {
    let Some(key) = ctx.keys.hmac_key_for(ctx.store, packet.from()) else {
        debug!("SW demands HMAC keys are configured");
        return false;
    };
    let Some(tag) = packet.params().get(super::hmac::PARAM) else {
        debug!("SW packet without HMAC from {}", packet.from());
        return false;
    };
    match verify_hmac(
        key,
        packet.to(),
        packet.from(),
        packet.ident(),
        packet.msg(),
        tag,
    ) {
        Ok(()) => true,
        Err(e) => {
            debug!("SW packet from {} rejected: {}", packet.from(), e);
            false
        }
    }
}

impl Application for SwitchApp {
    fn name(&self) -> &'static str {
        "switch"
    }

    fn handle(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Reply> {
        if packet.to().is_broadcast() || !packet.params().has(PARAM) {
            return None;
        }
        if !authenticated(ctx, packet) {
            return None;
        }

        let msg = packet.msg_str();
        let fields: Vec<&str> = msg.split(',').collect();
        let from = packet.from();
        let reply = match fields.as_slice() {
            ["A", challenge] => self.challenge(from, challenge, ctx.now),
            ["C", challenge, response, target, value] => {
                self.command(from, challenge, response, target, value, ctx.now)
            }
            _ => {
                debug!("SW packet parsing error");
                None
            }
        }?;

        Some(Reply::new(from.clone(), naked(PARAM), reply))
    }
}

/// Expires switch transactions
pub struct SwitchSweepTask {
    table: Rc<RefCell<TransactionTable>>,
}

impl SwitchSweepTask {
    pub fn new(table: Rc<RefCell<TransactionTable>>) -> Self {
        Self { table }
    }
}

impl Task<Network> for SwitchSweepTask {
    fn name(&self) -> &str {
        "switch"
    }

    fn run(&mut self, _net: &mut Network, now: u64) -> Reschedule {
        let gone = self.table.borrow_mut().sweep(now);
        if gone > 0 {
            debug!("expired {} switch transactions", gone);
        }
        Reschedule::After(Duration::from_millis(SWEEP_INTERVAL_MS))
    }
}

/// Switch bank kept in memory, for hosts without hardware and for tests.
///
/// Clones share state, so a host can keep a handle after boxing one into
/// the network.
#[derive(Debug, Clone, Default)]
pub struct MemorySwitch {
    inner: Rc<RefCell<SwitchBank>>,
}

#[derive(Debug, Default)]
struct SwitchBank {
    states: BTreeMap<String, String>,
    applied: usize,
}

impl MemorySwitch {
    /// Bank with the given targets, all initially `0`
    pub fn new<'a>(targets: impl IntoIterator<Item = &'a str>) -> Self {
        let bank = SwitchBank {
            states: targets
                .into_iter()
                .map(|t| (t.to_string(), "0".to_string()))
                .collect(),
            applied: 0,
        };
        Self {
            inner: Rc::new(RefCell::new(bank)),
        }
    }

    pub fn state(&self, target: &str) -> Option<String> {
        self.inner.borrow().states.get(target).cloned()
    }

    /// Number of commands carried out
    pub fn applied(&self) -> usize {
        self.inner.borrow().applied
    }
}

impl SwitchTarget for MemorySwitch {
    fn apply(&mut self, target: &str, value: &str) -> Option<String> {
        let mut bank = self.inner.borrow_mut();
        let state = bank.states.get_mut(target)?;
        *state = value.to_string();
        bank.applied += 1;
        Some(value.to_string())
    }

    fn query(&self, target: &str) -> Option<String> {
        self.state(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigStore, MemoryStore};
    use crate::mesh::crypto::{hmac_tag, KeyCache};
    use rand::SeedableRng;

    struct Fixture {
        app: SwitchApp,
        table: Rc<RefCell<TransactionTable>>,
        switch: MemorySwitch,
    }

    fn fixture() -> Fixture {
        let switch = MemorySwitch::new(["relay1", "relay2"]);
        let table = Rc::new(RefCell::new(TransactionTable::new()));
        let app = SwitchApp::new(
            Box::new(switch.clone()),
            table.clone(),
            StdRng::seed_from_u64(5),
        );
        Fixture { app, table, switch }
    }

    const PSK: &str = "s3cret";

    fn signed(s: &str) -> Packet {
        let packet = Packet::decode_l3(s.as_bytes(), 0).unwrap();
        let tag = hmac_tag(
            PSK.as_bytes(),
            packet.to(),
            packet.from(),
            packet.ident(),
            packet.msg(),
        )
        .unwrap();
        let mut params = packet.params().clone();
        params.put("H", tag);
        packet.change_params(params)
    }

    fn handle_packet(
        app: &mut SwitchApp,
        now: u64,
        packet: &Packet,
        psk: Option<&str>,
    ) -> Option<String> {
        let mut store = MemoryStore::new();
        if let Some(psk) = psk {
            store.set(keys::HMAC_PSK, psk);
        }
        let cache = KeyCache::new();
        let me = Callsign::new("PU5EPX");
        let ctx = ProtocolContext {
            me: &me,
            now,
            keys: &cache,
            store: &store,
        };
        app.handle(&ctx, packet).map(|reply| {
            assert_eq!(reply.to, Callsign::new("AAAA"));
            assert!(reply.params.is_naked("SW"));
            String::from_utf8(reply.msg).unwrap()
        })
    }

    /// Handles a correctly signed request on a node with the key set
    fn handle(app: &mut SwitchApp, now: u64, s: &str) -> Option<String> {
        handle_packet(app, now, &signed(s), Some(PSK))
    }

    /// Sends A, returns the response token
    fn open(f: &mut Fixture, now: u64, challenge: &str) -> String {
        let b = handle(
            &mut f.app,
            now,
            &format!("PU5EPX<AAAA:1,SW A,{}", challenge),
        )
        .unwrap();
        let fields: Vec<&str> = b.split(',').collect();
        assert_eq!(fields[0], "B");
        assert_eq!(fields[1], challenge);
        assert_eq!(fields[2].len(), RESPONSE_LEN);
        assert!(fields[2].chars().all(|c| c.is_ascii_alphanumeric()));
        fields[2].to_string()
    }

    fn command(f: &mut Fixture, now: u64, challenge: &str, response: &str, rest: &str) -> Option<String> {
        handle(
            &mut f.app,
            now,
            &format!(
                "PU5EPX<AAAA:2,SW C,{},{},{}",
                challenge, response, rest
            ),
        )
    }

    #[test]
    fn test_full_exchange() {
        let mut f = fixture();
        let response = open(&mut f, 0, "chal1234");
        let d = command(&mut f, 10, "chal1234", &response, "relay1,1").unwrap();
        assert_eq!(d, format!("D,chal1234,{},relay1,1", response));
        assert_eq!(f.switch.state("relay1").as_deref(), Some("1"));
        assert_eq!(f.switch.applied(), 1);
    }

    #[test]
    fn test_retransmitted_a_reuses_response() {
        let mut f = fixture();
        let r1 = open(&mut f, 0, "chal1234");
        let r2 = open(&mut f, 1000, "chal1234");
        assert_eq!(r1, r2);
        assert_eq!(f.table.borrow().len(), 1);
    }

    #[test]
    fn test_retransmitted_c_applies_once() {
        let mut f = fixture();
        let response = open(&mut f, 0, "chal1234");
        let d1 = command(&mut f, 10, "chal1234", &response, "relay1,1");
        let d2 = command(&mut f, 20, "chal1234", &response, "relay1,1");
        assert!(d1.is_some());
        assert_eq!(d1, d2);
        assert_eq!(f.switch.applied(), 1);
    }

    #[test]
    fn test_bad_commands_ignored() {
        let mut f = fixture();
        let response = open(&mut f, 0, "chal1234");

        assert!(command(&mut f, 1, "chal1234", "wrong123", "relay1,1").is_none());
        assert!(command(&mut f, 1, "other123", &response, "relay1,1").is_none());
        assert!(command(&mut f, 1, "chal1234", &response, "relay9,1").is_none());
        assert!(handle(&mut f.app, 1, "PU5EPX<AAAA:3,SW A,short").is_none());
        assert!(handle(&mut f.app, 1, "PU5EPX<AAAA:3,SW X,chal1234").is_none());
        assert_eq!(f.switch.applied(), 0);
    }

    #[test]
    fn test_requires_valid_hmac() {
        let mut f = fixture();
        let unsigned = Packet::decode_l3(b"PU5EPX<AAAA:1,SW A,chal1234", 0).unwrap();
        let forged = Packet::decode_l3(b"PU5EPX<AAAA:1,SW,H=000000000000 A,chal1234", 0).unwrap();

        assert!(handle_packet(&mut f.app, 0, &unsigned, Some(PSK)).is_none());
        assert!(handle_packet(&mut f.app, 0, &forged, Some(PSK)).is_none());
        // signed under another key
        assert!(handle_packet(&mut f.app, 0, &signed("PU5EPX<AAAA:1,SW A,chal1234"), Some("other")).is_none());
        assert!(f.table.borrow().is_empty());
    }

    #[test]
    fn test_no_key_configured_refuses_everything() {
        let mut f = fixture();
        let forged_a = Packet::decode_l3(b"PU5EPX<AAAA:1,SW,H=000000000000 A,chal1234", 0).unwrap();
        assert!(handle_packet(&mut f.app, 0, &forged_a, None).is_none());
        assert!(handle_packet(&mut f.app, 0, &signed("PU5EPX<AAAA:1,SW A,chal1234"), None).is_none());
        assert!(f.table.borrow().is_empty());

        // even with a transaction opened while the key was set
        let response = open(&mut f, 0, "chal1234");
        let c = format!("PU5EPX<AAAA:2,SW,H=000000000000 C,chal1234,{},relay1,1", response);
        let forged_c = Packet::decode_l3(c.as_bytes(), 0).unwrap();
        assert!(handle_packet(&mut f.app, 1, &forged_c, None).is_none());
        assert_eq!(f.switch.applied(), 0);
        assert_eq!(f.switch.state("relay1").as_deref(), Some("0"));
    }

    #[test]
    fn test_requires_unicast_and_param() {
        let mut f = fixture();
        assert!(handle(&mut f.app, 0, "QB<AAAA:1,SW A,chal1234").is_none());
        assert!(handle(&mut f.app, 0, "PU5EPX<AAAA:1 A,chal1234").is_none());
        assert!(f.table.borrow().is_empty());
    }

    #[test]
    fn test_query_does_not_apply() {
        let mut f = fixture();
        let response = open(&mut f, 0, "chal1234");
        let d = command(&mut f, 1, "chal1234", &response, "relay2,?").unwrap();
        assert!(d.ends_with(",relay2,0"));
        assert_eq!(f.switch.applied(), 0);
    }

    #[test]
    fn test_transactions_expire() {
        let mut f = fixture();
        let response = open(&mut f, 0, "chal1234");
        assert_eq!(f.table.borrow_mut().sweep(TRANSACTION_TTL_MS - 1), 0);
        assert_eq!(f.table.borrow_mut().sweep(TRANSACTION_TTL_MS), 1);
        assert!(command(&mut f, TRANSACTION_TTL_MS, "chal1234", &response, "relay1,1").is_none());
    }
}
