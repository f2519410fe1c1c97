//! Client access control: credentials, allow/deny lists and global request quotas.
//!
//! An [`AccessGuard`] is built from [`AppConfig`] and swapped as a whole on reload,
//! which also resets the quota windows.
use std::{
    net::{IpAddr, Ipv6Addr},
    str::FromStr,
    sync::Mutex,
};

use chrono::{DateTime, Local};
use http::HeaderMap;
use thiserror::Error;

use crate::config::models::{AppConfig, RequestLimits};

pub const USERNAME_HEADER: &str = "Meloy-Username";
pub const PASSWORD_HEADER: &str = "Meloy-Password";

const ACCOUNT_USER: &str = "account";
const MINUTE_WINDOW: &str = "%Y-%m-%d %H:%M";
const DAY_WINDOW: &str = "%Y-%m-%d";

/// CIDR network representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a network from an address and prefix length
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(format!("prefix length must be <= {max}"));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Parse `a.b.c.d`, `a.b.c.d/nn` or the IPv6 equivalents.
    /// A bare address is a single-host network.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let addr = IpAddr::from_str(ip).map_err(|e| format!("Invalid IP address: {e}"))?;
                let prefix_len: u8 = prefix
                    .parse()
                    .map_err(|e| format!("Invalid prefix length: {e}"))?;
                Self::new(addr, prefix_len)
            }
            None => {
                let addr = IpAddr::from_str(s).map_err(|e| format!("Invalid IP address: {e}"))?;
                let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self { addr, prefix_len })
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = (!0u32).checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = (!0u128)
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

/// Why a request was turned away before reaching any upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("Permission Denied")]
    Credentials,

    #[error("Permission Denied")]
    Client(Option<IpAddr>),

    #[error("API requests limit reached")]
    QuotaExhausted,
}

fn parse_networks(clients: &[String], list: &str) -> Vec<IpNetwork> {
    clients
        .iter()
        .filter_map(|client| match IpNetwork::parse(client) {
            Ok(network) => Some(network),
            Err(e) => {
                tracing::warn!(list, client = %client, error = %e, "Ignoring invalid client entry");
                None
            }
        })
        .collect()
}

/// Allow/deny evaluation for a list of networks.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
    loopback_exempt: bool,
}

impl ClientFilter {
    pub fn new(allow: Vec<IpNetwork>, deny: Vec<IpNetwork>) -> Self {
        Self {
            allow,
            deny,
            loopback_exempt: false,
        }
    }

    /// Let `::1` through regardless of the lists.
    pub fn with_loopback_exempt(mut self, exempt: bool) -> Self {
        self.loopback_exempt = exempt;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Deny wins over allow; a non-empty allow list admits only its members.
    pub fn permits(&self, client: Option<IpAddr>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(ip) = client.map(|ip| ip.to_canonical()) else {
            return self.allow.is_empty();
        };

        if self.loopback_exempt && ip == IpAddr::V6(Ipv6Addr::LOCALHOST) {
            return true;
        }
        if self.deny.iter().any(|n| n.contains(ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|n| n.contains(ip))
    }
}

#[derive(Debug, Default)]
struct QuotaWindow {
    key: String,
    remaining: u64,
}

impl QuotaWindow {
    fn roll(&mut self, key: String, limit: u64) {
        if self.key != key {
            self.key = key;
            self.remaining = limit;
        }
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    minute: QuotaWindow,
    day: QuotaWindow,
}

/// Global per-minute and per-day request counters.
#[derive(Debug)]
pub struct RequestQuota {
    limits: RequestLimits,
    state: Mutex<QuotaState>,
}

impl RequestQuota {
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::default()),
        }
    }

    pub fn limits(&self) -> RequestLimits {
        self.limits
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Local::now())
    }

    /// Take one request from every enabled window, or none if any is exhausted.
    pub fn try_acquire_at(&self, now: DateTime<Local>) -> bool {
        if self.limits.minute == 0 && self.limits.day == 0 {
            return true;
        }

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if self.limits.minute > 0 {
            state
                .minute
                .roll(now.format(MINUTE_WINDOW).to_string(), self.limits.minute);
            if state.minute.remaining == 0 {
                return false;
            }
        }
        if self.limits.day > 0 {
            state
                .day
                .roll(now.format(DAY_WINDOW).to_string(), self.limits.day);
            if state.day.remaining == 0 {
                return false;
            }
        }

        if self.limits.minute > 0 {
            state.minute.remaining -= 1;
        }
        if self.limits.day > 0 {
            state.day.remaining -= 1;
        }
        true
    }
}

/// Request admission built from the application config.
#[derive(Debug)]
pub struct AccessGuard {
    users: Vec<(String, String)>,
    clients: ClientFilter,
    quota: RequestQuota,
}

impl AccessGuard {
    pub fn from_config(app: &AppConfig) -> Self {
        let users = app
            .users
            .iter()
            .filter(|u| u.kind == ACCOUNT_USER)
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();

        let clients = ClientFilter::new(
            parse_networks(&app.allow.clients, "allow"),
            parse_networks(&app.deny.clients, "deny"),
        )
        .with_loopback_exempt(app.host == "0.0.0.0");

        Self {
            users,
            clients,
            quota: RequestQuota::new(app.limits.requests),
        }
    }

    pub fn check(&self, headers: &HeaderMap, client: Option<IpAddr>) -> Result<(), AccessDenied> {
        self.check_at(headers, client, Local::now())
    }

    /// Credentials, then client lists, then quota.
    pub fn check_at(
        &self,
        headers: &HeaderMap,
        client: Option<IpAddr>,
        now: DateTime<Local>,
    ) -> Result<(), AccessDenied> {
        if !self.credentials_match(headers) {
            return Err(AccessDenied::Credentials);
        }
        if !self.clients.permits(client) {
            return Err(AccessDenied::Client(client));
        }
        if !self.quota.try_acquire_at(now) {
            return Err(AccessDenied::QuotaExhausted);
        }
        Ok(())
    }

    fn credentials_match(&self, headers: &HeaderMap) -> bool {
        if self.users.is_empty() {
            return true;
        }
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };
        let (username, password) = (header(USERNAME_HEADER), header(PASSWORD_HEADER));
        self.users
            .iter()
            .any(|(u, p)| u == username && p == password)
    }
}
