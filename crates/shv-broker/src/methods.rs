//! Broker-intrinsic nodes and methods.
//!
//! Locally answered paths: the root (`ls`/`dir` over the mount tree),
//! `.app` (application identity and ping), `.broker` (administration,
//! SuperService access) and `.broker/currentClient` (per-peer session
//! management, Browse access). Intermediate nodes above mount points
//! answer `ls`/`dir` so the namespace browses as one tree.

use std::collections::{BTreeMap, BTreeSet};

use shv_core::rpcmessage::{RpcError, RpcMessage};
use shv_core::value::DateTime;
use shv_core::{AccessLevel, RpcValue};

use crate::broker::{subscription_param, Broker};

/// Application name reported on `.app:name`.
const APP_NAME: &str = "shvbroker";

/// Outcome of a locally dispatched method call.
pub(crate) enum LocalResult {
    Result(RpcValue),
    Error(RpcError),
    NotFound,
}

/// Dispatches a request that matched no mounted peer.
pub(crate) fn dispatch(
    broker: &mut Broker,
    client_id: i64,
    msg: &RpcMessage,
    granted: AccessLevel,
) -> LocalResult {
    let path = msg.path().to_string();
    let method = msg.method().unwrap_or_default().to_string();
    if !node_exists(broker, &path) {
        return LocalResult::NotFound;
    }
    match method.as_str() {
        "ls" => return ls(broker, &path, msg.param()),
        "dir" => return dir(&path, msg.param()),
        _ => {}
    }
    let Some(required) = method_access(&path, &method) else {
        return LocalResult::NotFound;
    };
    if granted < required {
        // The method is visible in dir at Browse, so denial is explicit.
        return LocalResult::Error(RpcError::method_call_exception("access denied"));
    }
    match (path.as_str(), method.as_str()) {
        (".app", "shvVersionMajor") => LocalResult::Result(RpcValue::from(3i64)),
        (".app", "shvVersionMinor") => LocalResult::Result(RpcValue::from(0i64)),
        (".app", "name") => LocalResult::Result(RpcValue::from(APP_NAME)),
        (".app", "version") => LocalResult::Result(RpcValue::from(env!("CARGO_PKG_VERSION"))),
        (".app", "ping") => LocalResult::Result(RpcValue::null()),
        (".app", "date") => LocalResult::Result(RpcValue::from(DateTime::now())),
        (".broker", "name") => LocalResult::Result(RpcValue::from(broker.config.name.as_str())),
        (".broker", "clients") => {
            let mut ids: Vec<i64> = broker.peers.keys().copied().collect();
            ids.sort_unstable();
            let list: Vec<RpcValue> = ids.into_iter().map(RpcValue::from).collect();
            LocalResult::Result(RpcValue::from(list))
        }
        (".broker", "mounts") => {
            let list: Vec<RpcValue> =
                broker.mounts.keys().map(|m| RpcValue::from(m.as_str())).collect();
            LocalResult::Result(RpcValue::from(list))
        }
        (".broker", "clientInfo") => {
            let Some(id) = msg.param().and_then(RpcValue::as_int) else {
                return LocalResult::Error(RpcError::invalid_param("Use Int"));
            };
            LocalResult::Result(client_info(broker, id).unwrap_or_default())
        }
        (".broker", "mountedClientInfo") => {
            let Some(path) = msg.param().and_then(|p| p.as_str()) else {
                return LocalResult::Error(RpcError::invalid_param("Use String with SHV path"));
            };
            let info = broker
                .mounts
                .iter()
                .find(|(m, _)| path == **m || path.starts_with(&format!("{m}/")))
                .and_then(|(_, id)| client_info(broker, *id));
            LocalResult::Result(info.unwrap_or_default())
        }
        (".broker", "disconnectClient") => {
            let Some(id) = msg.param().and_then(RpcValue::as_int) else {
                return LocalResult::Error(RpcError::invalid_param("Use Int"));
            };
            if !broker.peers.contains_key(&id) {
                return LocalResult::Error(RpcError::method_call_exception(format!(
                    "No such client with ID: {id}"
                )));
            }
            broker.disconnect_client(id);
            LocalResult::Result(RpcValue::null())
        }
        (".broker/currentClient", "info") => {
            LocalResult::Result(client_info(broker, client_id).unwrap_or_default())
        }
        (".broker/currentClient", "mountPoint") => {
            let mount = broker.peers.get(&client_id).and_then(|p| p.mount_point.clone());
            LocalResult::Result(mount.map(RpcValue::from).unwrap_or_default())
        }
        (".broker/currentClient", "userId") => {
            let user = broker.peers.get(&client_id).map(|p| p.user.clone()).unwrap_or_default();
            let user_id = if broker.config.name.is_empty() {
                user
            } else {
                format!("{}:{user}", broker.config.name)
            };
            LocalResult::Result(RpcValue::from(user_id))
        }
        (".broker/currentClient", "subscriptions") => {
            match broker.peers.get(&client_id) {
                Some(peer) => {
                    let list: Vec<RpcValue> =
                        peer.subscriptions.iter().map(|s| RpcValue::from(s.to_string())).collect();
                    LocalResult::Result(RpcValue::from(list))
                }
                None => LocalResult::Result(RpcValue::null()),
            }
        }
        (".broker/currentClient", "subscribe") => {
            let Some(ri) = subscription_param(msg.param()) else {
                return LocalResult::Error(RpcError::invalid_param("Use String or Map"));
            };
            let added = broker
                .peers
                .get_mut(&client_id)
                .map(|p| p.subscriptions.insert(ri))
                .unwrap_or(false);
            LocalResult::Result(RpcValue::from(added))
        }
        (".broker/currentClient", "unsubscribe") => {
            let Some(ri) = subscription_param(msg.param()) else {
                return LocalResult::Error(RpcError::invalid_param("Use String or Map"));
            };
            let existed = broker
                .peers
                .get_mut(&client_id)
                .map(|p| p.subscriptions.remove(&ri))
                .unwrap_or(false);
            LocalResult::Result(RpcValue::from(existed))
        }
        _ => LocalResult::NotFound,
    }
}

/// Access level each local method demands; `None` marks an unknown method.
fn method_access(path: &str, method: &str) -> Option<AccessLevel> {
    let level = match (path, method) {
        (_, "ls" | "dir") => AccessLevel::Browse,
        (".app", "shvVersionMajor" | "shvVersionMinor" | "name" | "version" | "ping" | "date") => {
            AccessLevel::Browse
        }
        (
            ".broker",
            "name" | "clients" | "mounts" | "clientInfo" | "mountedClientInfo"
            | "disconnectClient",
        ) => AccessLevel::SuperService,
        (
            ".broker/currentClient",
            "info" | "mountPoint" | "userId" | "subscriptions" | "subscribe" | "unsubscribe",
        ) => AccessLevel::Browse,
        _ => return None,
    };
    Some(level)
}

/// Whether `path` names a locally served node: an intrinsic one or an
/// intermediate node above a mount point.
fn node_exists(broker: &Broker, path: &str) -> bool {
    matches!(path, "" | ".app" | ".broker" | ".broker/client" | ".broker/currentClient")
        || broker.mounts.keys().any(|m| m.starts_with(&format!("{path}/")))
}

fn ls(broker: &Broker, path: &str, param: Option<&RpcValue>) -> LocalResult {
    let children = ls_children(broker, path);
    match param {
        None => {
            let list: Vec<RpcValue> = children.into_iter().map(RpcValue::from).collect();
            LocalResult::Result(RpcValue::from(list))
        }
        Some(p) => match p.as_str() {
            Some(name) => LocalResult::Result(RpcValue::from(children.contains(name))),
            None => LocalResult::Error(RpcError::invalid_param("Use Null or String")),
        },
    }
}

/// Child node names, sorted. The mount map contributes the first path
/// segment below `path` for every mount point under it.
fn ls_children(broker: &Broker, path: &str) -> BTreeSet<String> {
    let mut children = BTreeSet::new();
    match path {
        "" => {
            children.insert(".app".to_string());
            children.insert(".broker".to_string());
        }
        ".broker" => {
            children.insert("client".to_string());
            children.insert("currentClient".to_string());
        }
        ".broker/client" => {
            let mut ids: Vec<i64> = broker.peers.keys().copied().collect();
            ids.sort_unstable();
            children.extend(ids.into_iter().map(|id| id.to_string()));
        }
        _ => {}
    }
    for mount in broker.mounts.keys() {
        let rest = if path.is_empty() {
            mount.as_str()
        } else if let Some(rest) = mount.strip_prefix(&format!("{path}/")) {
            rest
        } else {
            continue;
        };
        if let Some(first) = rest.split('/').next() {
            children.insert(first.to_string());
        }
    }
    children
}

fn dir(path: &str, param: Option<&RpcValue>) -> LocalResult {
    let descs = dir_methods(path);
    match param {
        None => {
            let list: Vec<RpcValue> =
                descs.into_iter().map(|(name, flags, access)| method_desc(name, flags, access)).collect();
            LocalResult::Result(RpcValue::from(list))
        }
        Some(p) => match p.as_str() {
            Some(name) => {
                LocalResult::Result(RpcValue::from(descs.iter().any(|(n, _, _)| *n == name)))
            }
            None => LocalResult::Error(RpcError::invalid_param("Use Null or String")),
        },
    }
}

/// Method flag bits in a dir listing.
mod flags {
    pub const NONE: u64 = 0;
    pub const GETTER: u64 = 1 << 1;
}

fn dir_methods(path: &str) -> Vec<(&'static str, u64, AccessLevel)> {
    let mut res = vec![
        ("dir", flags::NONE, AccessLevel::Browse),
        ("ls", flags::NONE, AccessLevel::Browse),
    ];
    match path {
        ".app" => res.extend([
            ("shvVersionMajor", flags::GETTER, AccessLevel::Browse),
            ("shvVersionMinor", flags::GETTER, AccessLevel::Browse),
            ("name", flags::GETTER, AccessLevel::Browse),
            ("version", flags::GETTER, AccessLevel::Browse),
            ("ping", flags::NONE, AccessLevel::Browse),
            ("date", flags::GETTER, AccessLevel::Browse),
        ]),
        ".broker" => res.extend([
            ("name", flags::GETTER, AccessLevel::SuperService),
            ("clients", flags::GETTER, AccessLevel::SuperService),
            ("mounts", flags::GETTER, AccessLevel::SuperService),
            ("clientInfo", flags::NONE, AccessLevel::SuperService),
            ("mountedClientInfo", flags::NONE, AccessLevel::SuperService),
            ("disconnectClient", flags::NONE, AccessLevel::SuperService),
        ]),
        ".broker/currentClient" => res.extend([
            ("info", flags::GETTER, AccessLevel::Browse),
            ("mountPoint", flags::GETTER, AccessLevel::Browse),
            ("userId", flags::GETTER, AccessLevel::Browse),
            ("subscriptions", flags::GETTER, AccessLevel::Browse),
            ("subscribe", flags::NONE, AccessLevel::Browse),
            ("unsubscribe", flags::NONE, AccessLevel::Browse),
        ]),
        _ => {}
    }
    res
}

/// One method descriptor: `i{1: name, 2: flags, 5: access level}`.
fn method_desc(name: &str, flag_bits: u64, access: AccessLevel) -> RpcValue {
    let mut imap = BTreeMap::new();
    imap.insert(1i64, RpcValue::from(name));
    imap.insert(2i64, RpcValue::from(flag_bits));
    imap.insert(5i64, RpcValue::from(access as i64));
    RpcValue::from(imap)
}

fn client_info(broker: &Broker, client_id: i64) -> Option<RpcValue> {
    let peer = broker.peers.get(&client_id)?;
    let mut map = BTreeMap::new();
    map.insert("clientId".to_string(), RpcValue::from(client_id));
    map.insert("userName".to_string(), RpcValue::from(peer.user.as_str()));
    map.insert(
        "mountPoint".to_string(),
        peer.mount_point.as_deref().map(RpcValue::from).unwrap_or_default(),
    );
    let subs: Vec<RpcValue> =
        peer.subscriptions.iter().map(|s| RpcValue::from(s.to_string())).collect();
    map.insert("subscriptions".to_string(), RpcValue::from(subs));
    Some(RpcValue::from(map))
}

/// String value of a Map entry.
pub(crate) fn map_value(map: &BTreeMap<String, RpcValue>, name: &str) -> Option<String> {
    map.get(name)?.as_str().map(str::to_string)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests_support::broker_with_peers;
    use shv_core::rpcmessage::RpcErrorCode;

    fn names_of(value: &RpcValue) -> Vec<String> {
        value
            .as_list()
            .unwrap()
            .iter()
            .map(|d| d.as_imap().unwrap().get(&1).unwrap().as_str().unwrap().to_string())
            .collect()
    }

    fn call(broker: &mut Broker, client_id: i64, path: &str, method: &str, param: Option<RpcValue>) -> LocalResult {
        let msg = RpcMessage::request_with_id(1, path, method, param);
        dispatch(broker, client_id, &msg, AccessLevel::Admin)
    }

    #[test]
    fn test_root_ls_lists_intrinsics_and_mounts() {
        let mut broker = broker_with_peers(&[(1, Some("test/device"))]);
        let LocalResult::Result(value) = call(&mut broker, 1, "", "ls", None) else {
            panic!("expected result");
        };
        let children: Vec<&str> =
            value.as_list().unwrap().iter().map(|c| c.as_str().unwrap()).collect();
        assert_eq!(children, vec![".app", ".broker", "test"]);
    }

    #[test]
    fn test_ls_with_name_param_returns_bool() {
        let mut broker = broker_with_peers(&[]);
        let LocalResult::Result(value) = call(&mut broker, 1, "", "ls", Some(RpcValue::from(".app"))) else {
            panic!("expected result");
        };
        assert_eq!(value.as_bool(), Some(true));
        let LocalResult::Result(value) = call(&mut broker, 1, "", "ls", Some(RpcValue::from("ghost"))) else {
            panic!("expected result");
        };
        assert_eq!(value.as_bool(), Some(false));
    }

    #[test]
    fn test_intermediate_mount_node_answers_ls() {
        let mut broker = broker_with_peers(&[(1, Some("test/device"))]);
        let LocalResult::Result(value) = call(&mut broker, 1, "test", "ls", None) else {
            panic!("expected result");
        };
        let children: Vec<&str> =
            value.as_list().unwrap().iter().map(|c| c.as_str().unwrap()).collect();
        assert_eq!(children, vec!["device"]);
    }

    #[test]
    fn test_root_dir_contains_ls_and_dir() {
        let mut broker = broker_with_peers(&[]);
        let LocalResult::Result(value) = call(&mut broker, 1, "", "dir", None) else {
            panic!("expected result");
        };
        let names = names_of(&value);
        assert!(names.contains(&"ls".to_string()));
        assert!(names.contains(&"dir".to_string()));
    }

    #[test]
    fn test_unknown_node_is_not_found() {
        let mut broker = broker_with_peers(&[]);
        assert!(matches!(call(&mut broker, 1, "nowhere", "ls", None), LocalResult::NotFound));
    }

    #[test]
    fn test_unknown_method_on_known_node_is_not_found() {
        let mut broker = broker_with_peers(&[]);
        assert!(matches!(call(&mut broker, 1, ".app", "reboot", None), LocalResult::NotFound));
    }

    #[test]
    fn test_app_ping_and_identity() {
        let mut broker = broker_with_peers(&[]);
        let LocalResult::Result(value) = call(&mut broker, 1, ".app", "ping", None) else {
            panic!("expected result");
        };
        assert!(value.is_null());
        let LocalResult::Result(value) = call(&mut broker, 1, ".app", "shvVersionMajor", None) else {
            panic!("expected result");
        };
        assert_eq!(value.as_int(), Some(3));
    }

    #[test]
    fn test_broker_admin_methods_demand_super_service() {
        let mut broker = broker_with_peers(&[(1, None)]);
        let msg = RpcMessage::request_with_id(1, ".broker", "clients", None);
        let res = dispatch(&mut broker, 1, &msg, AccessLevel::Read);
        let LocalResult::Error(err) = res else { panic!("expected denial") };
        assert_eq!(err.code, RpcErrorCode::MethodCallException as i64);
        assert_eq!(err.message, "access denied");
    }

    #[test]
    fn test_subscribe_and_unsubscribe_round_trip() {
        let mut broker = broker_with_peers(&[(1, None)]);
        let param = RpcValue::from("test/**:*:chng");
        let LocalResult::Result(added) =
            call(&mut broker, 1, ".broker/currentClient", "subscribe", Some(param.clone()))
        else {
            panic!("expected result");
        };
        assert_eq!(added.as_bool(), Some(true));

        // Second subscribe of the same RI reports it as already present.
        let LocalResult::Result(added) =
            call(&mut broker, 1, ".broker/currentClient", "subscribe", Some(param.clone()))
        else {
            panic!("expected result");
        };
        assert_eq!(added.as_bool(), Some(false));

        let LocalResult::Result(subs) =
            call(&mut broker, 1, ".broker/currentClient", "subscriptions", None)
        else {
            panic!("expected result");
        };
        assert_eq!(subs.as_list().unwrap().len(), 1);

        let LocalResult::Result(removed) =
            call(&mut broker, 1, ".broker/currentClient", "unsubscribe", Some(param.clone()))
        else {
            panic!("expected result");
        };
        assert_eq!(removed.as_bool(), Some(true));
        let LocalResult::Result(removed) =
            call(&mut broker, 1, ".broker/currentClient", "unsubscribe", Some(param))
        else {
            panic!("expected result");
        };
        assert_eq!(removed.as_bool(), Some(false));
    }

    #[test]
    fn test_client_info_shape() {
        let mut broker = broker_with_peers(&[(1, Some("test/device"))]);
        let LocalResult::Result(info) =
            call(&mut broker, 1, ".broker", "clientInfo", Some(RpcValue::from(1i64)))
        else {
            panic!("expected result");
        };
        let map = info.as_map().unwrap();
        assert_eq!(map.get("clientId").and_then(|v| v.as_int()), Some(1));
        assert_eq!(map.get("mountPoint").and_then(|v| v.as_str()), Some("test/device"));
    }
}
