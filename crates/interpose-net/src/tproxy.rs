//! Netfilter TPROXY and bridge command sets.

use std::fmt;
use std::sync::Arc;

use interpose_core::defaults;
use serde::{Deserialize, Serialize};

use crate::configurator::{CommandRunner, Configurator, ShellRunner, Step};

/// Default ebtables match for the client side of a bridge.
pub const DEFAULT_BRIDGE_CLIENT_FILTER: &str = "-p ipv4 --ip-proto udp --ip-dport 64240";
/// Default ebtables match for the server side of a bridge.
pub const DEFAULT_BRIDGE_SERVER_FILTER: &str = "-p ipv4 --ip-proto udp --ip-sport 64240";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TproxyOptions {
    pub chain: String,
    pub mark: u32,
    pub table: u32,
    pub client_iface: String,
    pub server_iface: String,
    /// Extra iptables match narrowing what gets intercepted.
    pub filter: String,
}

impl Default for TproxyOptions {
    fn default() -> Self {
        Self {
            chain: defaults::DEFAULT_TPROXY_CHAIN.to_string(),
            mark: defaults::DEFAULT_TPROXY_MARK,
            table: defaults::DEFAULT_TPROXY_TABLE,
            client_iface: defaults::DEFAULT_CLIENT_IFACE.to_string(),
            server_iface: defaults::DEFAULT_SERVER_IFACE.to_string(),
            filter: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    pub bridge: String,
    pub client_iface: String,
    pub server_iface: String,
    pub client_filter: String,
    pub server_filter: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            bridge: defaults::DEFAULT_BRIDGE_NAME.to_string(),
            client_iface: defaults::DEFAULT_CLIENT_IFACE.to_string(),
            server_iface: defaults::DEFAULT_SERVER_IFACE.to_string(),
            client_filter: DEFAULT_BRIDGE_CLIENT_FILTER.to_string(),
            server_filter: DEFAULT_BRIDGE_SERVER_FILTER.to_string(),
        }
    }
}

/// Joins non-empty fragments with single spaces.
fn cmd(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Redirect `protocol` traffic arriving on the client interface to local
/// `port` with TPROXY, marking and routing it back to the local stack.
pub fn tproxy_configurator(port: u16, protocol: Protocol, opts: &TproxyOptions) -> Configurator {
    tproxy_configurator_with(port, protocol, opts, Arc::new(ShellRunner))
}

pub fn tproxy_configurator_with(
    port: u16,
    protocol: Protocol,
    opts: &TproxyOptions,
    runner: Arc<dyn CommandRunner>,
) -> Configurator {
    let chain = opts.chain.as_str();
    let (mark, table, port, proto) = (
        opts.mark.to_string(),
        opts.table.to_string(),
        port.to_string(),
        protocol.to_string(),
    );
    let (mark, table, port, proto) = (mark.as_str(), table.as_str(), port.as_str(), proto.as_str());
    let (iface, filter) = (opts.client_iface.as_str(), opts.filter.as_str());

    let mut c = Configurator::with_runner("tproxy", runner);
    c.push(Step::new(
        [cmd(&["iptables -t mangle -N", chain])],
        [cmd(&["iptables -t mangle -X", chain])],
    ))
    .push(Step::new(
        [
            cmd(&["iptables -t mangle -A", chain, "-j MARK --set-mark", mark]),
            cmd(&["iptables -t mangle -A", chain, "-j ACCEPT"]),
        ],
        [cmd(&["iptables -t mangle -F", chain])],
    ))
    .push(Step::new(
        [cmd(&["iptables -t mangle -A PREROUTING -p", proto, "-m socket -j", chain])],
        [cmd(&["iptables -t mangle -D PREROUTING -p", proto, "-m socket -j", chain])],
    ))
    .push(Step::new(
        [cmd(&["ip rule add fwmark", mark, "lookup", table])],
        [cmd(&["ip rule del fwmark", mark, "lookup", table])],
    ))
    .push(Step::new(
        [cmd(&["ip route add local 0/0 dev lo table", table])],
        [cmd(&["ip route del local 0/0 dev lo table", table])],
    ))
    .push(Step::new(
        [cmd(&[
            "iptables -t mangle -A PREROUTING -p",
            proto,
            "-i",
            iface,
            filter,
            "-j TPROXY --on-port",
            port,
            "--tproxy-mark",
            mark,
        ])],
        [cmd(&[
            "iptables -t mangle -D PREROUTING -p",
            proto,
            "-i",
            iface,
            filter,
            "-j TPROXY --on-port",
            port,
            "--tproxy-mark",
            mark,
        ])],
    ))
    .push(Step::new(
        [cmd(&["iptables -I INPUT -p", proto, "-m mark --mark", mark, "-j ACCEPT"])],
        [cmd(&["iptables -D INPUT -p", proto, "-m mark --mark", mark, "-j ACCEPT"])],
    ));
    c
}

/// Bridge the client and server interfaces and divert the filtered traffic
/// to the local stack with an ebtables broute rule.
pub fn bridge_configurator(opts: &BridgeOptions) -> Configurator {
    bridge_configurator_with(opts, Arc::new(ShellRunner))
}

pub fn bridge_configurator_with(opts: &BridgeOptions, runner: Arc<dyn CommandRunner>) -> Configurator {
    let br = opts.bridge.as_str();
    let mut c = Configurator::with_runner("bridge", runner);
    c.push(Step::new(
        [cmd(&["ip link add name", br, "type bridge"])],
        [cmd(&["ip link delete", br, "type bridge"])],
    ))
    .push(Step::new(
        [cmd(&["ip link set", br, "up"])],
        [cmd(&["ip link set", br, "down"])],
    ));
    for iface in [opts.client_iface.as_str(), opts.server_iface.as_str()] {
        c.push(Step::new(
            [cmd(&["ip link set", iface, "master", br])],
            [cmd(&["ip link set", iface, "nomaster"])],
        ));
    }
    for (iface, filter) in [
        (opts.client_iface.as_str(), opts.client_filter.as_str()),
        (opts.server_iface.as_str(), opts.server_filter.as_str()),
    ] {
        let rule = |action: &str| {
            cmd(&[
                "ebtables -t broute",
                action,
                "BROUTING -i",
                iface,
                filter,
                "-j redirect --redirect-target DROP",
            ])
        };
        c.push(Step::new([rule("-A")], [rule("-D")]));
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::tests::RecordingRunner;

    #[test]
    fn test_tproxy_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let mut c = tproxy_configurator_with(8080, Protocol::Tcp, &TproxyOptions::default(), runner.clone());
        c.configure(false).unwrap();
        let cmds = runner.commands.lock().unwrap().clone();
        assert_eq!(cmds[0], "iptables -t mangle -N INTERCEPT");
        assert_eq!(cmds[1], "iptables -t mangle -A INTERCEPT -j MARK --set-mark 64");
        assert_eq!(cmds[3], "iptables -t mangle -A PREROUTING -p tcp -m socket -j INTERCEPT");
        assert_eq!(cmds[4], "ip rule add fwmark 64 lookup 101");
        assert_eq!(cmds[5], "ip route add local 0/0 dev lo table 101");
        assert_eq!(
            cmds[6],
            "iptables -t mangle -A PREROUTING -p tcp -i eth0 -j TPROXY --on-port 8080 --tproxy-mark 64"
        );
        assert_eq!(cmds[7], "iptables -I INPUT -p tcp -m mark --mark 64 -j ACCEPT");
    }

    #[test]
    fn test_tproxy_teardown_order() {
        let runner = Arc::new(RecordingRunner::default());
        let opts = TproxyOptions {
            filter: "-s 10.0.0.0/8".into(),
            ..Default::default()
        };
        let mut c = tproxy_configurator_with(53, Protocol::Udp, &opts, runner.clone());
        c.assume_applied();
        c.deconfigure(false).unwrap();
        let cmds = runner.commands.lock().unwrap().clone();
        assert_eq!(cmds.first().unwrap(), "iptables -D INPUT -p udp -m mark --mark 64 -j ACCEPT");
        assert_eq!(
            cmds[1],
            "iptables -t mangle -D PREROUTING -p udp -i eth0 -s 10.0.0.0/8 -j TPROXY --on-port 53 --tproxy-mark 64"
        );
        assert_eq!(cmds.last().unwrap(), "iptables -t mangle -X INTERCEPT");
    }

    #[test]
    fn test_bridge_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let mut c = bridge_configurator_with(&BridgeOptions::default(), runner.clone());
        c.configure(false).unwrap();
        c.deconfigure(false).unwrap();
        let cmds = runner.commands.lock().unwrap().clone();
        assert_eq!(cmds[0], "ip link add name br0 type bridge");
        assert_eq!(cmds[2], "ip link set eth0 master br0");
        assert_eq!(cmds[3], "ip link set eth1 master br0");
        assert_eq!(
            cmds[4],
            "ebtables -t broute -A BROUTING -i eth0 -p ipv4 --ip-proto udp --ip-dport 64240 -j redirect --redirect-target DROP"
        );
        assert_eq!(
            cmds[6],
            "ebtables -t broute -D BROUTING -i eth1 -p ipv4 --ip-proto udp --ip-sport 64240 -j redirect --redirect-target DROP"
        );
        assert_eq!(cmds.last().unwrap(), "ip link delete br0 type bridge");
    }

    #[test]
    fn test_bridge_enslaves_client_iface() {
        let runner = Arc::new(RecordingRunner::default());
        let opts = BridgeOptions {
            bridge: "br7".into(),
            client_iface: "veth-c".into(),
            server_iface: "veth-s".into(),
            ..Default::default()
        };
        let mut c = bridge_configurator_with(&opts, runner.clone());
        c.configure(false).unwrap();
        let cmds = runner.commands.lock().unwrap().clone();
        assert_eq!(cmds.len(), 6);
        assert_eq!(cmds[2], "ip link set veth-c master br7");
        assert_eq!(cmds[3], "ip link set veth-s master br7");
        assert!(cmds[4].starts_with("ebtables -t broute -A BROUTING -i veth-c "));
        assert!(cmds[5].starts_with("ebtables -t broute -A BROUTING -i veth-s "));
    }
}
