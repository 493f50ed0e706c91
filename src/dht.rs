//! The DHT facade: owns self-id, the routing table, the event
//! dispatcher, and the KRPC builder; implements the upstream event
//! consumer and the periodic maintenance tasks. `spec.md` §4.G.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::dispatcher::{Event, EventDispatcher, LocalRequest, StepOutcome};
use crate::error::DhtError;
use crate::krpc::{self, KrpcBuilder, KrpcMessage, Query, Response, TransactionId};
use crate::lookup;
use crate::node::{self, Distance, Node, NodeId};
use crate::routing::{self, MaintenanceAction, RoutingTable};

const UPDATE_ALL_PERIOD: Duration = Duration::from_secs(120);
const RANDOM_PROBE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum DhtTimer {
    BootstrapJoin,
    UpdateAll,
    RandomProbe,
}

pub struct Dht {
    self_id: NodeId,
    krpc: KrpcBuilder,
    routing: RoutingTable,
    dispatcher: EventDispatcher<DhtTimer>,
    bootstrap_hosts: Vec<String>,
}

impl Dht {
    pub fn new(config: &Config) -> Result<Dht, DhtError> {
        let self_id = config.self_id.unwrap_or_else(NodeId::random);
        let bind_addr = SocketAddrV4::new(config.local_ip, config.local_port);
        let mut dispatcher = EventDispatcher::bind(bind_addr).map_err(DhtError::Bind)?;

        dispatcher.start_timer(crate::timer::TimerSpec {
            period: Duration::from_millis(1),
            payload: DhtTimer::BootstrapJoin,
            oneshot: true,
        });
        dispatcher.start_timer(crate::timer::TimerSpec {
            period: UPDATE_ALL_PERIOD,
            payload: DhtTimer::UpdateAll,
            oneshot: false,
        });
        dispatcher.start_timer(crate::timer::TimerSpec {
            period: RANDOM_PROBE_PERIOD,
            payload: DhtTimer::RandomProbe,
            oneshot: false,
        });

        log::info!("dht node {} listening on {bind_addr}", self_id);

        Ok(Dht {
            self_id,
            krpc: KrpcBuilder::new(self_id),
            routing: RoutingTable::new(),
            dispatcher,
            bootstrap_hosts: config.bootstrap.clone(),
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddrV4> {
        self.dispatcher.local_addr()
    }

    /// Runs one iteration of the host loop: a single dispatcher step,
    /// dispatched to the event or timer handler as appropriate.
    pub fn step(&mut self) {
        match self.dispatcher.step() {
            Some(StepOutcome::Event(ev)) => {
                self.handle_event(&ev);
                self.dispatcher.finish_event(ev);
            }
            Some(StepOutcome::TimerFired(timer)) => self.handle_timer(timer),
            None => {}
        }
    }

    /// Spins the event loop until `t` resolves, processing every event
    /// observed along the way (not just the one being waited on) —
    /// the cooperative re-entrant primitive from `spec.md` §4.D/§5.
    pub fn wait_response(&mut self, t: &TransactionId) -> Event {
        self.dispatcher.mark_sync_wait(t);
        loop {
            if let Some(ev) = self.dispatcher.take_resolved(t) {
                return ev;
            }
            match self.dispatcher.step() {
                Some(StepOutcome::Event(ev)) => {
                    self.handle_event(&ev);
                    self.dispatcher.finish_event(ev);
                }
                Some(StepOutcome::TimerFired(timer)) => self.handle_timer(timer),
                None => {}
            }
        }
    }

    fn handle_event(&mut self, ev: &Event) {
        match ev {
            Event::Startup | Event::Quit => {}
            Event::Request { remote, from } => self.handle_request(remote, *from),
            Event::Response { local, remote, from } => self.handle_response(local, remote, *from),
            Event::Timeout { local } => self.handle_timeout(local),
            Event::Error { local, remote, from } => self.handle_error(local, remote, *from),
        }
    }

    fn handle_request(&mut self, remote: &KrpcMessage, from: SocketAddrV4) {
        let KrpcMessage::Query { t, query } = remote else {
            return;
        };
        match query {
            Query::Ping { id } => {
                self.observe(*id, from);
                let reply = self.krpc.ping_response(t.clone());
                self.dispatcher.send_reply(reply, from);
            }
            Query::FindNode { id, target } => {
                self.observe(*id, from);
                let near = self.routing.find_near_nodes(target);
                let reply = self.krpc.find_node_response(t.clone(), &near);
                self.dispatcher.send_reply(reply, from);
            }
            Query::GetPeers { id, .. } => {
                // get_peers/announce_peer (peer storage) are out of
                // scope; spec.md §4.G allows answering with error 204.
                self.observe(*id, from);
                let reply = self.krpc.error(t.clone(), krpc::ERR_UNKNOWN_METHOD, "get_peers not supported");
                self.dispatcher.send_reply(reply, from);
            }
            Query::Unknown { .. } => {
                let reply = self.krpc.error(t.clone(), krpc::ERR_UNKNOWN_METHOD, "unknown method");
                self.dispatcher.send_reply(reply, from);
            }
        }
    }

    fn handle_response(&mut self, _local: &LocalRequest, remote: &KrpcMessage, from: SocketAddrV4) {
        if let KrpcMessage::Response { response, .. } = remote {
            self.observe(*response.id(), from);
        }
    }

    fn handle_timeout(&mut self, local: &LocalRequest) {
        // No explicit liveness counter: a contact that doesn't respond
        // simply never gets its last_seen refreshed, and ages into
        // INACTIVE/DEAD under the routing table's own state model.
        log::debug!("query to {} timed out (tid {:?})", local.addr, local.t);
    }

    fn handle_error(&mut self, local: &LocalRequest, remote: &KrpcMessage, from: SocketAddrV4) {
        log::debug!("error response from {from} for tid {:?}: {:?}", local.t, remote);
    }

    fn observe(&mut self, id: NodeId, addr: SocketAddrV4) {
        if id != self.self_id {
            self.routing.observe(&self.self_id, Node::new(id, addr));
        }
    }

    fn handle_timer(&mut self, timer: DhtTimer) {
        match timer {
            DhtTimer::BootstrapJoin => self.run_bootstrap_join(),
            DhtTimer::UpdateAll => self.run_update_all(),
            DhtTimer::RandomProbe => self.run_random_probe(),
        }
    }

    fn run_bootstrap_join(&mut self) {
        let addrs = lookup::resolve_bootstrap_addrs(&self.bootstrap_hosts);
        if addrs.is_empty() {
            log::warn!("bootstrap join has no resolvable routers, skipping");
            return;
        }
        let candidates = self.send_round(self.self_id, &addrs, lookup::BOOTSTRAP_TIMEOUT);
        if candidates.is_empty() {
            log::warn!("bootstrap join got no responses");
            return;
        }
        let seed = lookup::merge_closest(&self.self_id, &[], candidates, lookup::ROUND_WIDTH);
        let found = self.run_find_node(self.self_id, seed, lookup::PER_REQUEST_TIMEOUT);
        log::info!("bootstrap join complete: {} contacts", found.len());
    }

    fn run_update_all(&mut self) {
        let actions = self.routing.update_all(Instant::now());
        for action in actions {
            match action {
                MaintenanceAction::PingInactive(contact) => {
                    let query = self.krpc.find_node(contact.id);
                    self.dispatcher
                        .send(query, contact.addr, None, false, lookup::PER_REQUEST_TIMEOUT);
                }
                MaintenanceAction::RefreshBucket { target } => {
                    let seed = self.routing.find_near_nodes(&target);
                    self.run_find_node(target, seed, lookup::PER_REQUEST_TIMEOUT);
                }
            }
        }
    }

    fn run_random_probe(&mut self) {
        let target = NodeId::random();
        let seed = self.routing.find_near_nodes(&target);
        self.run_find_node(target, seed, lookup::PER_REQUEST_TIMEOUT);
    }

    /// Runs an iterative `find_node` lookup to convergence on `target`,
    /// per `spec.md` §4.F steps 2-4.
    fn run_find_node(&mut self, target: NodeId, seed: Vec<Node>, timeout: Duration) -> Vec<Node> {
        let mut near = seed;
        if near.is_empty() {
            return near;
        }
        node::sort_by_distance(&target, &mut near);
        let mut distance_min = Distance::MAX;
        let mut distance_cur = near[0].id.distance(&target);

        while distance_cur < distance_min {
            let addrs: Vec<SocketAddrV4> = near.iter().map(|n| n.addr).collect();
            let candidates = self.send_round(target, &addrs, timeout);
            if candidates.is_empty() {
                break;
            }
            distance_min = distance_cur;
            near = lookup::merge_closest(&target, &near, candidates, lookup::ROUND_WIDTH);
            distance_cur = near[0].id.distance(&target);
        }

        near.truncate(routing::K);
        near
    }

    /// Sends `find_node(target)` to every address in `addrs` and
    /// synchronously collects the compact-node candidates from
    /// whichever respond, per `spec.md` §4.F step 3a/3b. Responders
    /// are folded into the routing table as a side effect of
    /// `handle_response`, which runs inside `wait_response`.
    fn send_round(&mut self, target: NodeId, addrs: &[SocketAddrV4], timeout: Duration) -> Vec<Node> {
        let mut tids = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let query = self.krpc.find_node(target);
            let t = self.dispatcher.send(query, *addr, None, true, timeout);
            tids.push(t);
        }
        let mut candidates = Vec::new();
        for t in tids {
            let event = self.wait_response(&t);
            if let Event::Response {
                remote: KrpcMessage::Response {
                    response: Response::FindNode { nodes, .. },
                    ..
                },
                ..
            } = event
            {
                candidates.extend(node::parse_compact_nodes(&nodes));
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback_config() -> Config {
        Config {
            local_ip: Ipv4Addr::LOCALHOST,
            local_port: 0,
            self_id: None,
            bootstrap: Vec::new(),
        }
    }

    #[test]
    fn ping_round_trip_over_loopback_populates_routing_table() {
        let mut a = Dht::new(&loopback_config()).unwrap();
        let mut b = Dht::new(&loopback_config()).unwrap();
        let b_addr = b.local_addr().unwrap();

        let query = a.krpc.ping();
        let tid = a.dispatcher.send(query, b_addr, None, true, Duration::from_secs(2));

        for _ in 0..20 {
            b.step();
        }

        let event = a.wait_response(&tid);
        assert!(matches!(event, Event::Response { .. }));

        let total: usize = a.routing.buckets().iter().map(|bucket| bucket.len()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn find_node_request_replies_with_near_nodes() {
        let mut a = Dht::new(&loopback_config()).unwrap();
        let mut b = Dht::new(&loopback_config()).unwrap();
        let b_addr = b.local_addr().unwrap();

        let target = NodeId::random();
        let query = a.krpc.find_node(target);
        let tid = a.dispatcher.send(query, b_addr, None, true, Duration::from_secs(2));

        for _ in 0..20 {
            b.step();
        }

        let event = a.wait_response(&tid);
        match event {
            Event::Response {
                remote: KrpcMessage::Response {
                    response: Response::FindNode { .. },
                    ..
                },
                ..
            } => {}
            _ => panic!("expected a find_node response"),
        }
    }
}
