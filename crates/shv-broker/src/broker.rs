//! The router: a single task owning all shared broker state.
//!
//! Peers never touch the peer table, the mount map, the subscription sets
//! or the pending-request table directly; they send [`RouterEvent`]s into
//! one channel and the router mutates everything serially. Outgoing
//! messages go through bounded per-peer queues; a peer whose queue
//! overflows is disconnected instead of backpressuring the router.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use shv_core::login::LoginParams;
use shv_core::rpcmessage::{RpcError, RpcMessage, RpcMessageType};
use shv_core::{AccessLevel, RpcRi, RpcValue};

use crate::config::BrokerConfig;
use crate::methods::{self, LocalResult};
use crate::{autosetup, methods::map_value};

/// Capacity of one peer's send queue. Overflow disconnects the peer.
pub const SEND_QUEUE_CAPACITY: usize = 64;

/// Idle timeout once a peer has logged in.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Idle timeout before login; unauthenticated peers go away quickly.
pub const LOGIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Soft deadline for a forwarded request.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Grace period before an invalid login closes the link.
const INVALID_LOGIN_CLOSE_DELAY: Duration = Duration::from_secs(1);

/// Mount points may not shadow the broker-intrinsic namespaces.
const RESERVED_ROOTS: [&str; 4] = ["", ".app", ".broker", ".device"];

// ── Channel types ─────────────────────────────────────────────────────────────

/// Link-side knobs the router controls; peers watch this value.
#[derive(Debug, Clone)]
pub struct PeerControl {
    pub idle_timeout: Duration,
    /// Once set the peer tasks shut the link down.
    pub drop_link: bool,
}

impl Default for PeerControl {
    fn default() -> Self {
        Self { idle_timeout: LOGIN_IDLE_TIMEOUT, drop_link: false }
    }
}

/// Router's way to reach one peer.
pub struct PeerLink {
    pub sender: mpsc::Sender<RpcMessage>,
    pub control: watch::Sender<PeerControl>,
}

/// How a new peer authenticates.
pub enum PeerAuth {
    /// Inbound connection; must run the hello/login handshake.
    Login,
    /// Broker-initiated connection, already logged in on the remote side.
    Preauth { user: String, roles: Vec<String>, mount_point: Option<String> },
}

/// Events feeding the router task.
pub enum RouterEvent {
    PeerConnected { link: PeerLink, auth: PeerAuth, reply: oneshot::Sender<i64> },
    PeerDisconnected { client_id: i64 },
    Message { client_id: i64, msg: RpcMessage },
    DropPeer { client_id: i64, reason: &'static str },
    Shutdown,
}

/// Cloneable handle used by peer tasks and listeners.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<RouterEvent>,
}

impl BrokerHandle {
    /// Registers a connected link and returns its client id, or `None` when
    /// the router is gone.
    pub async fn register(&self, link: PeerLink, auth: PeerAuth) -> Option<i64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RouterEvent::PeerConnected { link, auth, reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn message(&self, client_id: i64, msg: RpcMessage) -> bool {
        self.tx.send(RouterEvent::Message { client_id, msg }).await.is_ok()
    }

    pub async fn disconnected(&self, client_id: i64) {
        let _ = self.tx.send(RouterEvent::PeerDisconnected { client_id }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RouterEvent::Shutdown).await;
    }

    fn drop_peer_later(&self, client_id: i64, delay: Duration, reason: &'static str) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RouterEvent::DropPeer { client_id, reason }).await;
        });
    }
}

// ── Peer state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Waiting for `hello`.
    Hello,
    /// `hello` answered, waiting for `login`.
    Login { nonce: String },
    Active,
}

pub(crate) struct Peer {
    pub(crate) link: PeerLink,
    pub(crate) stage: Stage,
    pub(crate) user: String,
    pub(crate) roles: Vec<String>,
    pub(crate) device_id: Option<String>,
    pub(crate) mount_point: Option<String>,
    pub(crate) subscriptions: BTreeSet<RpcRi>,
}

impl Peer {
    fn new(link: PeerLink) -> Self {
        Self {
            link,
            stage: Stage::Hello,
            user: String::new(),
            roles: Vec::new(),
            device_id: None,
            mount_point: None,
            subscriptions: BTreeSet::new(),
        }
    }
}

struct PendingRequest {
    origin: i64,
    origin_rqid: i64,
    origin_cids: Vec<i64>,
    deadline: Instant,
}

// ── Broker ────────────────────────────────────────────────────────────────────

/// Router task state. Construct with [`Broker::new`], then await
/// [`Broker::run`].
pub struct Broker {
    pub(crate) config: Arc<BrokerConfig>,
    rx: mpsc::Receiver<RouterEvent>,
    handle: BrokerHandle,
    pub(crate) peers: HashMap<i64, Peer>,
    pub(crate) mounts: BTreeMap<String, i64>,
    /// Keyed by (destination client id, request id on that destination).
    pending: HashMap<(i64, i64), PendingRequest>,
    rqid: shv_core::rpcmessage::RequestIdGenerator,
    next_client_id: i64,
}

impl Broker {
    pub fn new(config: Arc<BrokerConfig>) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(1024);
        let handle = BrokerHandle { tx };
        let broker = Self {
            config,
            rx,
            handle: handle.clone(),
            peers: HashMap::new(),
            mounts: BTreeMap::new(),
            pending: HashMap::new(),
            rqid: shv_core::rpcmessage::RequestIdGenerator::new(),
            next_client_id: 0,
        };
        (broker, handle)
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Runs the router until [`BrokerHandle::shutdown`] or until every
    /// handle is dropped.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(RouterEvent::PeerConnected { link, auth, reply }) => {
                        let id = self.register_peer(link, auth);
                        let _ = reply.send(id);
                    }
                    Some(RouterEvent::PeerDisconnected { client_id }) => {
                        self.disconnect_peer(client_id, "link closed");
                    }
                    Some(RouterEvent::DropPeer { client_id, reason }) => {
                        self.disconnect_peer(client_id, reason);
                    }
                    Some(RouterEvent::Message { client_id, msg }) => {
                        self.handle_message(client_id, msg);
                    }
                    Some(RouterEvent::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.sweep_deadlines(),
            }
        }
        info!("router stopping, disconnecting {} peers", self.peers.len());
        let ids: Vec<i64> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect_peer(id, "broker shutdown");
        }
    }

    // ── Peer lifecycle ────────────────────────────────────────────────────────

    fn register_peer(&mut self, link: PeerLink, auth: PeerAuth) -> i64 {
        let client_id = self.next_client_id;
        self.next_client_id += 1;
        let mut peer = Peer::new(link);
        match auth {
            PeerAuth::Login => {
                info!(client_id, "peer connected, waiting for login");
            }
            PeerAuth::Preauth { user, roles, mount_point } => {
                peer.stage = Stage::Active;
                peer.user = user;
                peer.roles = roles;
                let _ = peer
                    .link
                    .control
                    .send(PeerControl { idle_timeout: DEFAULT_IDLE_TIMEOUT, drop_link: false });
                self.peers.insert(client_id, peer);
                if let Some(mp) = mount_point {
                    match self.try_mount(client_id, &mp) {
                        Ok(()) => {}
                        Err(err) => warn!(client_id, mount = %mp, %err, "outbound mount failed"),
                    }
                }
                info!(client_id, "outbound peer registered");
                return client_id;
            }
        }
        self.peers.insert(client_id, peer);
        client_id
    }

    /// Administrative disconnect, used by `.broker:disconnectClient`.
    pub(crate) fn disconnect_client(&mut self, client_id: i64) {
        self.disconnect_peer(client_id, "disconnected by administrator");
    }

    fn disconnect_peer(&mut self, client_id: i64, reason: &str) {
        let Some(peer) = self.peers.remove(&client_id) else {
            return;
        };
        info!(client_id, reason, "disconnecting peer");
        peer.link.control.send_modify(|c| c.drop_link = true);
        if let Some(mount) = &peer.mount_point {
            self.mounts.remove(mount);
            self.signal_mount_change(mount, false);
        }

        // Answer whoever is waiting on the dead peer.
        let dead_dest: Vec<(i64, i64)> = self
            .pending
            .keys()
            .filter(|(dest, _)| *dest == client_id)
            .copied()
            .collect();
        for key in dead_dest {
            let entry = self.pending.remove(&key).expect("key just listed");
            let resp = RpcMessage::error_response(
                entry.origin_rqid,
                &entry.origin_cids,
                RpcError::method_call_exception("destination disconnected"),
            );
            self.send_to_peer(entry.origin, resp);
        }
        // Late replies towards the dead peer have nowhere to go.
        self.pending.retain(|_, entry| entry.origin != client_id);
    }

    /// Checks that a mount point neither shadows an intrinsic namespace nor
    /// overlaps an existing mount in either direction.
    fn check_mount_free(&self, mount: &str) -> Result<(), RpcError> {
        let first = mount.split('/').next().unwrap_or("");
        if RESERVED_ROOTS.contains(&first) {
            return Err(RpcError::method_call_exception("mount point not allowed"));
        }
        let occupied = self.mounts.keys().any(|m| {
            m == mount
                || m.starts_with(&format!("{mount}/"))
                || mount.starts_with(&format!("{m}/"))
        });
        if occupied {
            return Err(RpcError::method_call_exception("mount point occupied"));
        }
        Ok(())
    }

    fn try_mount(&mut self, client_id: i64, mount_point: &str) -> Result<(), RpcError> {
        let mount = mount_point.trim_end_matches('/');
        self.check_mount_free(mount)?;
        self.mounts.insert(mount.to_string(), client_id);
        if let Some(peer) = self.peers.get_mut(&client_id) {
            peer.mount_point = Some(mount.to_string());
        }
        info!(client_id, mount, "peer mounted");
        self.signal_mount_change(mount, true);
        Ok(())
    }

    // ── Message handling ──────────────────────────────────────────────────────

    fn handle_message(&mut self, client_id: i64, msg: RpcMessage) {
        let Some(peer) = self.peers.get(&client_id) else {
            return;
        };
        if peer.stage != Stage::Active {
            self.handle_login_phase(client_id, msg);
            return;
        }
        match msg.classify() {
            Ok(RpcMessageType::Request) => self.handle_request(client_id, msg),
            Ok(RpcMessageType::Response) => self.handle_response(client_id, msg),
            Ok(RpcMessageType::Signal) => self.handle_signal(client_id, msg),
            Err(err) => warn!(client_id, %err, "dropping invalid message"),
        }
    }

    // ── Login ─────────────────────────────────────────────────────────────────

    fn handle_login_phase(&mut self, client_id: i64, msg: RpcMessage) {
        if msg.classify() != Ok(RpcMessageType::Request) {
            debug!(client_id, "dropping non-request before login");
            return;
        }
        let method = msg.method().unwrap_or_default().to_string();
        if !msg.path().is_empty() {
            let resp = msg.make_error_response(RpcError::login_required("Use hello and login methods"));
            self.send_to_peer(client_id, resp);
            return;
        }
        match method.as_str() {
            "hello" => {
                let nonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(10)
                    .map(char::from)
                    .collect();
                if let Some(peer) = self.peers.get_mut(&client_id) {
                    peer.stage = Stage::Login { nonce: nonce.clone() };
                }
                let mut result = BTreeMap::new();
                result.insert("nonce".to_string(), RpcValue::from(nonce));
                let resp = msg.make_response(RpcValue::from(result));
                self.send_to_peer(client_id, resp);
            }
            "login" => {
                let Some(peer) = self.peers.get(&client_id) else { return };
                let Stage::Login { nonce } = peer.stage.clone() else {
                    let resp = msg.make_error_response(RpcError::login_required("Use hello method"));
                    self.send_to_peer(client_id, resp);
                    return;
                };
                match self.try_login(client_id, &msg, &nonce) {
                    Ok(resp) => self.send_to_peer(client_id, resp),
                    Err(err) => {
                        let resp = msg.make_error_response(err);
                        self.send_to_peer(client_id, resp);
                    }
                }
            }
            _ => {
                let hint = match self.peers.get(&client_id).map(|p| &p.stage) {
                    Some(Stage::Login { .. }) => "Use login method",
                    _ => "Use hello method",
                };
                let resp = msg.make_error_response(RpcError::login_required(hint));
                self.send_to_peer(client_id, resp);
            }
        }
    }

    fn try_login(
        &mut self,
        client_id: i64,
        msg: &RpcMessage,
        nonce: &str,
    ) -> Result<RpcMessage, RpcError> {
        let param = msg.param().cloned().unwrap_or_default();
        let login = LoginParams::from_value(&param)
            .ok_or_else(|| RpcError::invalid_param("Invalid login parameter"))?;
        let Some(user) = self.config.login(&login, nonce) else {
            warn!(client_id, user = %login.user, "invalid login");
            self.handle.drop_peer_later(client_id, INVALID_LOGIN_CLOSE_DELAY, "invalid login");
            return Err(RpcError::login_required("Invalid login"));
        };
        let user_name = user.name.clone();
        let roles = user.roles.clone();
        info!(client_id, user = %user_name, "peer logged in");

        // Mount point: an explicit request must be allowed by the roles and
        // free; otherwise auto-setup may assign one by device id. Both are
        // settled before any peer state changes so a refused login leaves
        // the peer untouched.
        let mut initial_subs: Vec<RpcRi> = Vec::new();
        let mount_point = if let Some(requested) = &login.mount_point {
            let requested = requested.trim_end_matches('/');
            if !self.config.mount_point_allowed(&roles, requested) {
                return Err(RpcError::method_call_exception("mount point not allowed"));
            }
            self.check_mount_free(requested)?;
            Some(requested.to_string())
        } else if let Some(device_id) = &login.device_id {
            if let Some(setup) = self.config.autosetup_for(device_id, &roles) {
                initial_subs.extend(setup.subscriptions.iter().cloned());
                match &setup.mount_point {
                    Some(template) => {
                        let existing: BTreeSet<String> = self.mounts.keys().cloned().collect();
                        let generated = autosetup::generate_mount_point(
                            template,
                            &existing,
                            device_id,
                            &user_name,
                            &roles,
                        );
                        if generated.is_none() {
                            return Err(RpcError::method_call_exception("mount point occupied"));
                        }
                        generated
                    }
                    None => None,
                }
            } else {
                None
            }
        } else {
            None
        };

        {
            let peer = self.peers.get_mut(&client_id).expect("caller checked the peer");
            peer.stage = Stage::Active;
            peer.user = user_name;
            peer.roles = roles;
            peer.device_id = login.device_id.clone();
            peer.subscriptions.extend(initial_subs);
            let idle = login
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT);
            let _ = peer.link.control.send(PeerControl { idle_timeout: idle, drop_link: false });
        }
        if let Some(mp) = mount_point {
            self.try_mount(client_id, &mp)?;
        }

        let mut result = BTreeMap::new();
        result.insert("clientId".to_string(), RpcValue::from(client_id));
        Ok(msg.make_response(RpcValue::from(result)))
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    fn handle_request(&mut self, client_id: i64, mut msg: RpcMessage) {
        let path = canonical_path(msg.path());
        msg.set_path(&path);

        let peer = self.peers.get(&client_id).expect("message from a live peer");
        let method = msg.method().unwrap_or_default().to_string();
        let Some(granted) = self.resolve_access(&peer.roles, &path, &method) else {
            let resp = msg.make_error_response(RpcError::method_not_found("No access"));
            self.send_to_peer(client_id, resp);
            return;
        };
        // Clamp: carried access is lowered to what the roles grant, never
        // raised.
        let effective = match msg.access_level() {
            Some(carried) if carried < granted => carried,
            _ => granted,
        };
        msg.set_access_level(Some(effective));

        if let Some((dest, rel_path)) = self.locate_destination(&path) {
            self.forward_request(client_id, dest, rel_path, msg);
            return;
        }

        match methods::dispatch(self, client_id, &msg, effective) {
            LocalResult::Result(value) => {
                let resp = msg.make_response(value);
                self.send_to_peer(client_id, resp);
            }
            LocalResult::Error(err) => {
                let resp = msg.make_error_response(err);
                self.send_to_peer(client_id, resp);
            }
            LocalResult::NotFound => {
                let resp = msg.make_error_response(RpcError::method_not_found(format!(
                    "No such method: {path}:{method}"
                )));
                self.send_to_peer(client_id, resp);
            }
        }
    }

    /// Resolves a path to a mounted peer: `.broker/client/<ID>/…` addresses
    /// a peer directly, anything else goes through the longest mount-point
    /// prefix.
    fn locate_destination(&self, path: &str) -> Option<(i64, String)> {
        if let Some(rest) = path.strip_prefix(".broker/client/") {
            let (id, rel) = match rest.split_once('/') {
                Some((id, rel)) => (id, rel),
                None => (rest, ""),
            };
            let id: i64 = id.parse().ok()?;
            return self.peers.contains_key(&id).then(|| (id, rel.to_string()));
        }
        let mut best: Option<(&String, i64)> = None;
        for (mount, id) in &self.mounts {
            if path == mount || path.starts_with(&format!("{mount}/")) {
                match best {
                    Some((prev, _)) if prev.len() >= mount.len() => {}
                    _ => best = Some((mount, *id)),
                }
            }
        }
        let (mount, id) = best?;
        let rel = path[mount.len()..].trim_start_matches('/').to_string();
        Some((id, rel))
    }

    fn forward_request(&mut self, origin: i64, dest: i64, rel_path: String, msg: RpcMessage) {
        let origin_rqid = msg.request_id().expect("classified as request");
        let origin_cids = match msg.caller_ids() {
            Ok(cids) => cids,
            Err(err) => {
                warn!(origin, %err, "dropping request");
                return;
            }
        };
        let mut fwd = msg;
        fwd.set_path(&rel_path);
        if fwd.push_caller_id(origin).is_err() {
            return;
        }
        let rqid = self.rqid.next();
        fwd.set_request_id(Some(rqid));
        self.pending.insert(
            (dest, rqid),
            PendingRequest {
                origin,
                origin_rqid,
                origin_cids,
                deadline: Instant::now() + REQUEST_DEADLINE,
            },
        );
        self.send_to_peer(dest, fwd);
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    fn handle_response(&mut self, client_id: i64, msg: RpcMessage) {
        let rqid = msg.request_id().expect("classified as response");
        let Some(entry) = self.pending.remove(&(client_id, rqid)) else {
            match msg.caller_ids() {
                Ok(cids) if cids.is_empty() => {
                    // Response to a broker-originated call (watchdog ping,
                    // subscription pushes); consumed here.
                    debug!(client_id, rqid, "broker-directed response");
                }
                Ok(_) => debug!(client_id, rqid, "late or unknown response dropped"),
                Err(err) => warn!(client_id, %err, "dropping response"),
            }
            return;
        };
        let mut fwd = msg;
        fwd.set_request_id(Some(entry.origin_rqid));
        fwd.set_caller_ids(&entry.origin_cids);
        self.send_to_peer(entry.origin, fwd);
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<(i64, i64)> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            let entry = self.pending.remove(&key).expect("key just listed");
            debug!(origin = entry.origin, "request timed out");
            let resp = RpcMessage::error_response(
                entry.origin_rqid,
                &entry.origin_cids,
                RpcError::method_call_exception("timeout"),
            );
            self.send_to_peer(entry.origin, resp);
        }
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    fn handle_signal(&mut self, client_id: i64, msg: RpcMessage) {
        let Some(mount) = self.peers.get(&client_id).and_then(|p| p.mount_point.clone()) else {
            debug!(client_id, "signal from unmounted peer dropped");
            return;
        };
        let path = msg.path();
        let ext_path = if path.is_empty() { mount } else { format!("{mount}/{path}") };
        let mut fwd = msg;
        fwd.set_path(&ext_path);
        self.broadcast_signal(&fwd, Some(client_id));
    }

    /// Fans a signal out to every subscribed peer with at least Browse
    /// access on the signal's path. No deduplication, source order kept.
    pub(crate) fn broadcast_signal(&mut self, msg: &RpcMessage, exclude: Option<i64>) {
        let path = msg.path().to_string();
        let method = msg.method().unwrap_or("get").to_string();
        let signal = msg.signal_name().to_string();
        let targets: Vec<i64> = self
            .peers
            .iter()
            .filter(|(id, peer)| {
                Some(**id) != exclude
                    && peer.stage == Stage::Active
                    && peer.subscriptions.iter().any(|s| s.match_signal(&path, &method, &signal))
                    && self
                        .resolve_access(&peer.roles, &path, &method)
                        .is_some_and(|l| l >= AccessLevel::Browse)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.send_to_peer(id, msg.clone());
        }
    }

    /// Emits the `lsmod` signal describing a mount appearing or vanishing.
    fn signal_mount_change(&mut self, mount: &str, added: bool) {
        let others: Vec<&String> = self.mounts.keys().filter(|m| *m != mount).collect();
        let segments: Vec<&str> = mount.split('/').collect();
        let mut split = segments.len() - 1;
        for i in 1..=segments.len() {
            let prefix = segments[..i].join("/");
            let shared = others
                .iter()
                .any(|m| **m == prefix || m.starts_with(&format!("{prefix}/")));
            if !shared {
                split = i - 1;
                break;
            }
        }
        let parent = segments[..split].join("/");
        let name = segments[split];
        let mut change = BTreeMap::new();
        change.insert(name.to_string(), RpcValue::from(added));
        let sig = RpcMessage::signal(
            &parent,
            "ls",
            "lsmod",
            Some(RpcValue::from(change)),
            AccessLevel::Browse,
        );
        self.broadcast_signal(&sig, None);
    }

    // ── Shared helpers ────────────────────────────────────────────────────────

    /// Access from the configured roles plus the floor every logged-in peer
    /// has on the broker-intrinsic nodes.
    pub(crate) fn resolve_access(
        &self,
        roles: &[String],
        path: &str,
        method: &str,
    ) -> Option<AccessLevel> {
        let configured = self.config.access_level(roles, path, method);
        let builtin = match path {
            ".broker/currentClient" => Some(AccessLevel::Read),
            "" | ".app" | ".broker" => Some(AccessLevel::Browse),
            _ => None,
        };
        configured.max(builtin)
    }

    /// Queues a message towards a peer. A full queue marks the peer as a
    /// slow consumer and disconnects it.
    pub(crate) fn send_to_peer(&mut self, client_id: i64, msg: RpcMessage) {
        let Some(peer) = self.peers.get(&client_id) else {
            debug!(client_id, "message for a gone peer dropped");
            return;
        };
        match peer.link.sender.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "send queue overflow");
                self.disconnect_peer(client_id, "slow consumer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id, "send queue closed");
            }
        }
    }
}

/// Strips trailing slashes and rewrites the deprecated `.app/broker` alias
/// onto `.broker`.
fn canonical_path(path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path == ".app/broker" {
        ".broker".to_string()
    } else if let Some(rest) = path.strip_prefix(".app/broker/") {
        format!(".broker/{rest}")
    } else {
        path.to_string()
    }
}

/// Builds the subscription RI out of the `subscribe` parameter, which is
/// either a string RI or a map with `path`, `method` and `signal` keys.
/// Absent fields default to match-all, except that a map naming path or
/// method but no signal subscribes to `chng`.
pub(crate) fn subscription_param(param: Option<&RpcValue>) -> Option<RpcRi> {
    let Some(param) = param else {
        return Some(RpcRi::new("**", "*", "*"));
    };
    if let Some(ri) = param.as_str() {
        return Some(RpcRi::parse(ri));
    }
    let map = param.as_map()?;
    let path = map_value(map, "path").unwrap_or_else(|| "**".to_string());
    let method = map_value(map, "method").unwrap_or_else(|| "*".to_string());
    let signal = match map_value(map, "signal") {
        Some(s) => s,
        None if map.contains_key("path") || map.contains_key("method") => "chng".to_string(),
        None => "*".to_string(),
    };
    Some(RpcRi::new(path, method, signal))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Builds a broker with pre-registered active peers for unit tests.
    /// The peers' channels have no task behind them; queued messages are
    /// simply dropped.
    pub(crate) fn broker_with_peers(peers: &[(i64, Option<&str>)]) -> Broker {
        let (mut broker, _handle) = Broker::new(Arc::new(BrokerConfig::default()));
        for (id, mount) in peers {
            let (sender, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
            let (control, ctrl_rx) = watch::channel(PeerControl::default());
            std::mem::forget(rx);
            std::mem::forget(ctrl_rx);
            let mut peer = Peer::new(PeerLink { sender, control });
            peer.stage = Stage::Active;
            peer.user = format!("user{id}");
            broker.peers.insert(*id, peer);
            if let Some(mount) = mount {
                broker.mounts.insert(mount.to_string(), *id);
                broker.peers.get_mut(id).expect("just inserted").mount_point =
                    Some(mount.to_string());
            }
            broker.next_client_id = broker.next_client_id.max(id + 1);
        }
        broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_broker(mounts: &[(&str, i64)]) -> Broker {
        let (mut broker, _handle) = Broker::new(Arc::new(BrokerConfig::default()));
        for (mount, id) in mounts {
            broker.mounts.insert(mount.to_string(), *id);
        }
        broker
    }

    #[test]
    fn test_locate_destination_longest_prefix() {
        let broker = test_broker(&[("test", 1), ("test/device", 2)]);
        assert_eq!(broker.locate_destination("test/device/track"), Some((2, "track".into())));
        assert_eq!(broker.locate_destination("test/other"), Some((1, "other".into())));
        assert_eq!(broker.locate_destination("test/device"), Some((2, String::new())));
        assert_eq!(broker.locate_destination("unrelated"), None);
    }

    #[test]
    fn test_locate_destination_does_not_match_name_prefixes() {
        let broker = test_broker(&[("test/device", 2)]);
        assert_eq!(broker.locate_destination("test/devicex"), None);
    }

    #[test]
    fn test_canonical_path_rewrites_legacy_alias() {
        assert_eq!(canonical_path(".app/broker"), ".broker");
        assert_eq!(canonical_path(".app/broker/currentClient"), ".broker/currentClient");
        assert_eq!(canonical_path("test/device/"), "test/device");
        assert_eq!(canonical_path(".app"), ".app");
    }

    #[test]
    fn test_subscription_param_defaults() {
        assert_eq!(subscription_param(None), Some(RpcRi::new("**", "*", "*")));
        assert_eq!(
            subscription_param(Some(&RpcValue::from("test/**:*:chng"))),
            Some(RpcRi::new("test/**", "*", "chng"))
        );
    }

    #[test]
    fn test_subscription_param_map_signal_default() {
        let mut map = BTreeMap::new();
        map.insert("path".to_string(), RpcValue::from("test/device/**"));
        let ri = subscription_param(Some(&RpcValue::from(map.clone()))).unwrap();
        assert_eq!(ri, RpcRi::new("test/device/**", "*", "chng"));

        map.insert("signal".to_string(), RpcValue::from("*"));
        let ri = subscription_param(Some(&RpcValue::from(map))).unwrap();
        assert_eq!(ri, RpcRi::new("test/device/**", "*", "*"));
    }

    #[test]
    fn test_subscription_param_bad_type() {
        assert_eq!(subscription_param(Some(&RpcValue::from(1i64))), None);
    }
}
