//! Launch descriptor for the supervised foreground process.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Flag names used to pass the bind address and concurrency to the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchFlags {
    pub host: String,
    pub port: String,
    pub workers: String,
}

impl Default for LaunchFlags {
    fn default() -> Self {
        Self {
            host: "--host".to_string(),
            port: "--port".to_string(),
            workers: "--workers".to_string(),
        }
    }
}

/// Exact command, binding and worker count, fixed at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub executable: String,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub workers: u32,
    #[serde(default)]
    pub flags: LaunchFlags,
}

impl LaunchDescriptor {
    pub fn validate(&self) -> Result<(), String> {
        if self.executable.trim().is_empty() {
            return Err("launch executable must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("launch port must be > 0".to_string());
        }
        if self.workers == 0 {
            return Err("launch workers must be >= 1".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("launch host must not be empty".to_string());
        }
        for flag in [&self.flags.host, &self.flags.port, &self.flags.workers] {
            if flag.trim().is_empty() {
                return Err("launch flag names must not be empty".to_string());
            }
            if self.args.iter().any(|arg| arg == flag) {
                return Err(format!(
                    "launch args must not contain '{flag}'; it is composed from the descriptor"
                ));
            }
        }
        Ok(())
    }

    /// Full argv: executable, fixed args, then bind address, port and workers.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 7);
        argv.push(self.executable.clone());
        argv.extend(self.args.iter().cloned());
        argv.push(self.flags.host.clone());
        argv.push(self.host.clone());
        argv.push(self.flags.port.clone());
        argv.push(self.port.to_string());
        argv.push(self.flags.workers.clone());
        argv.push(self.workers.to_string());
        argv
    }

    /// Address a local probe should dial: loopback when bound to all interfaces.
    pub fn probe_host(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) if addr.is_unspecified() => "127.0.0.1".to_string(),
            Ok(IpAddr::V6(addr)) if addr.is_unspecified() => "[::1]".to_string(),
            Ok(IpAddr::V6(addr)) => format!("[{addr}]"),
            _ => self.host.clone(),
        }
    }
}
