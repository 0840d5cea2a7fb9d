//! Daemon configuration from the environment.
//!
//! Every knob has an environment variable; the command line may override
//! any of them before the daemon starts.

use std::env;

/// Default unicast port, used for TCP, UDP, and the keystore file name.
pub const DEFAULT_PORT: &str = "9695";

#[derive(Debug, Clone)]
pub struct Config {
    /// Port string for the main listeners (`CCN_LOCAL_PORT`).
    pub port: String,
    /// Explicit unix-domain socket path (`CCN_LOCAL_SOCKNAME`).
    pub local_sockname: Option<String>,
    /// Debug bitmask (`CCND_DEBUG`); not the log level.
    pub debug: u32,
    /// Content store capacity in objects (`CCND_CAP`); 0 forces
    /// freshness-zero mode.
    pub capacity: usize,
    pub force_zero_freshness: bool,
    /// Packet stuffing target (`CCND_MTU`), clamped 0..=8800.
    pub mtu: usize,
    /// Base pacing delay (`CCND_DATA_PAUSE_MICROSEC`), clamped
    /// 1..=1_000_000.
    pub data_pause_microsec: u32,
    /// Default freshness when the object names none
    /// (`CCND_DEFAULT_TIME_TO_STALE`, seconds).
    pub tts_default: i32,
    /// Upper bound on freshness (`CCND_MAX_TIME_TO_STALE`, seconds).
    pub tts_limit: i32,
    /// Bind list (`CCND_LISTEN_ON`); empty means wildcards.
    pub listen_on: Option<String>,
    /// URIs auto-registered on new non-local faces (`CCND_AUTOREG`).
    pub autoreg: Vec<String>,
    /// Keystore directory override (`CCND_KEYSTORE_DIRECTORY`).
    pub keystore_directory: Option<String>,
    /// Ceiling for predicted response times (`CCND_MAX_RTE_MICROSEC`).
    pub predicted_response_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            local_sockname: None,
            debug: 0,
            capacity: 50_000,
            force_zero_freshness: false,
            mtu: 0,
            data_pause_microsec: 10_000,
            tts_default: -1,
            tts_limit: -1,
            listen_on: None,
            autoreg: Vec::new(),
            keystore_directory: None,
            predicted_response_limit: 160_000,
        }
    }
}

impl Config {
    /// Read the whole configuration from the environment.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(port) = getenv("CCN_LOCAL_PORT") {
            if !port.is_empty() && port.parse::<u16>().is_ok() {
                cfg.port = port;
            }
        }
        cfg.local_sockname = getenv("CCN_LOCAL_SOCKNAME").filter(|s| !s.is_empty());
        if let Some(v) = getenv("CCND_DEBUG") {
            cfg.debug = parse_debug(&v);
        }
        if let Some(v) = getenv_num("CCND_CAP") {
            if v == 0 {
                cfg.force_zero_freshness = true;
                cfg.capacity = 10;
            } else {
                cfg.capacity = v as usize;
            }
        }
        if let Some(v) = getenv_num("CCND_MTU") {
            cfg.mtu = (v as usize).min(8800);
        }
        if let Some(v) = getenv_num("CCND_DATA_PAUSE_MICROSEC") {
            cfg.data_pause_microsec = (v as u32).clamp(1, 1_000_000);
        }
        if let Some(v) = getenv_num("CCND_DEFAULT_TIME_TO_STALE") {
            cfg.tts_default = v as i32;
        }
        if let Some(v) = getenv_num("CCND_MAX_TIME_TO_STALE") {
            cfg.tts_limit = v as i32;
        }
        if let Some(v) = getenv_num("CCND_MAX_RTE_MICROSEC") {
            if v >= 127 {
                cfg.predicted_response_limit = v as u32;
            }
        }
        cfg.listen_on = getenv("CCND_LISTEN_ON").filter(|s| !s.is_empty());
        if let Some(v) = getenv("CCND_AUTOREG") {
            cfg.autoreg = parse_uri_list(&v);
        }
        cfg.keystore_directory = getenv("CCND_KEYSTORE_DIRECTORY").filter(|s| !s.is_empty());
        cfg
    }

    /// The unix-domain socket path, derived from the port when not set
    /// explicitly.
    pub fn local_sockname(&self) -> String {
        if let Some(s) = &self.local_sockname {
            return s.clone();
        }
        if self.port == DEFAULT_PORT {
            "/tmp/.ccnd.sock".to_string()
        } else {
            format!("/tmp/.ccnd.sock.{}", self.port)
        }
    }

    /// Effective default staleness, in seconds, for objects that carry
    /// no FreshnessSeconds.
    pub fn effective_tts_default(&self) -> i32 {
        self.tts_default
    }
}

fn getenv(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn getenv_num(name: &str) -> Option<i64> {
    env::var(name).ok()?.trim().parse::<i64>().ok()
}

/// `CCND_DEBUG` accepts a decimal bitmask; -1 means everything.
fn parse_debug(s: &str) -> u32 {
    match s.trim().parse::<i64>() {
        Ok(-1) => u32::MAX,
        Ok(v) if v >= 0 => v as u32,
        _ => 0,
    }
}

/// Whitespace/comma/semicolon separated URI list.
pub fn parse_uri_list(s: &str) -> Vec<String> {
    s.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/* debug bitmask bits */
pub const DBG_TRAFFIC: u32 = 1; /* interest/content traces */
pub const DBG_LOW: u32 = 2;
pub const DBG_CONTENT: u32 = 4;
pub const DBG_MATCH: u32 = 8;
pub const DBG_INTEREST: u32 = 16;
pub const DBG_GORY: u32 = 32;
pub const DBG_TIMESTAMP: u32 = 64;
pub const DBG_FACES: u32 = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_bitmask_parses_minus_one_as_all() {
        assert_eq!(parse_debug("-1"), u32::MAX);
        assert_eq!(parse_debug("6"), 6);
        assert_eq!(parse_debug("junk"), 0);
    }

    #[test]
    fn uri_list_splits_on_all_separators() {
        let v = parse_uri_list("ccnx:/a, ccnx:/b;ccnx:/c\nccnx:/d");
        assert_eq!(v.len(), 4);
        assert_eq!(v[3], "ccnx:/d");
    }

    #[test]
    fn sockname_derives_from_port() {
        let mut cfg = Config::default();
        assert_eq!(cfg.local_sockname(), "/tmp/.ccnd.sock");
        cfg.port = "7000".into();
        assert_eq!(cfg.local_sockname(), "/tmp/.ccnd.sock.7000");
        cfg.local_sockname = Some("/run/x.sock".into());
        assert_eq!(cfg.local_sockname(), "/run/x.sock");
    }
}
