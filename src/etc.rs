//! Generated `/etc/hosts`, `/etc/hostname`, and `/etc/resolv.conf`.
//!
//! Files are written into the bundle directory and bind mounted over the
//! image's copies, so the rootfs itself is never modified.

use crate::collaborators::HostEntry;
use crate::constants::FALLBACK_NAMESERVERS;
use crate::error::{Error, Result};
use crate::mounts::paths::{chown_if_needed, resolve_in_root};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// DNS overrides for the generated `resolv.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    pub servers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

/// Inputs for [`generate`].
#[derive(Debug, Clone)]
pub struct EtcRequest<'a> {
    pub bundle: &'a Path,
    pub rootfs: &'a Path,
    pub hostname: &'a str,
    /// `name:ip` entries.
    pub add_hosts: &'a [String],
    pub dns: &'a DnsOptions,
    /// Host resolver configuration to start from.
    pub host_resolv_conf: &'a Path,
    /// True when the container shares the host network namespace.
    pub host_network: bool,
    /// Host IDs of container root, which owns the generated files.
    pub owner: (u32, u32),
}

/// Generates the files and returns them keyed by container destination.
pub fn generate(request: &EtcRequest<'_>) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    files.insert("/etc/hosts".to_string(), generate_hosts(request)?);
    if !request.hostname.is_empty() {
        files.insert("/etc/hostname".to_string(), generate_hostname(request)?);
    }
    files.insert("/etc/resolv.conf".to_string(), generate_resolv_conf(request)?);
    Ok(files)
}

fn write_owned(path: &Path, content: &str, owner: (u32, u32)) -> Result<()> {
    std::fs::write(path, content)?;
    chown_if_needed(path, owner.0, owner.1)?;
    Ok(())
}

/// `/etc/hosts`: the image's file, localhost entries, `add_hosts`, and the
/// container hostname.
pub fn generate_hosts(request: &EtcRequest<'_>) -> Result<PathBuf> {
    let image_hosts = resolve_in_root(request.rootfs, "/etc/hosts")?;
    let mut content = match std::fs::read_to_string(&image_hosts) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    if !has_host(&content, "localhost") {
        content.push_str("127.0.0.1\tlocalhost localhost.localdomain localhost4 localhost4.localdomain4\n");
        content.push_str("::1\tlocalhost localhost.localdomain localhost6 localhost6.localdomain6\n");
    }
    for entry in request.add_hosts {
        let (name, ip) = entry.split_once(':').ok_or_else(|| {
            Error::Config(format!("invalid add-host entry '{entry}', expected name:ip"))
        })?;
        let _ = writeln!(content, "{ip}\t{name}");
    }
    if !request.hostname.is_empty() && !has_host(&content, request.hostname) {
        let _ = writeln!(content, "127.0.1.1\t{}", request.hostname);
    }

    let path = request.bundle.join("hosts");
    write_owned(&path, &content, request.owner)?;
    Ok(path)
}

fn has_host(content: &str, name: &str) -> bool {
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .any(|l| l.split_whitespace().skip(1).any(|n| n == name))
}

/// Appends entries produced by network configuration to a hosts file.
pub fn add_host_entries(hosts: &Path, entries: &[HostEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut content = std::fs::read_to_string(hosts)?;
    for entry in entries {
        let _ = writeln!(content, "{}\t{}", entry.ip, entry.names.join(" "));
    }
    std::fs::write(hosts, content)?;
    Ok(())
}

/// `/etc/hostname`.
pub fn generate_hostname(request: &EtcRequest<'_>) -> Result<PathBuf> {
    let path = request.bundle.join("hostname");
    write_owned(&path, &format!("{}\n", request.hostname), request.owner)?;
    Ok(path)
}

/// `/etc/resolv.conf`: the host's resolver settings with caller overrides.
///
/// Loopback nameservers only work from the host network namespace and are
/// dropped otherwise; if nothing usable remains, public fallbacks are used.
pub fn generate_resolv_conf(request: &EtcRequest<'_>) -> Result<PathBuf> {
    let host = match std::fs::read_to_string(request.host_resolv_conf) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut servers = Vec::new();
    let mut search = Vec::new();
    let mut options = Vec::new();
    for line in host.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => servers.extend(fields.map(String::from)),
            Some("search") | Some("domain") => {
                search = fields.map(String::from).collect();
            }
            Some("options") => options.extend(fields.map(String::from)),
            _ => {}
        }
    }

    let dns = request.dns;
    if !dns.servers.is_empty() {
        servers = dns.servers.clone();
    }
    if !dns.search.is_empty() {
        search = if dns.search == ["."] { Vec::new() } else { dns.search.clone() };
    }
    if !dns.options.is_empty() {
        options = dns.options.clone();
    }

    if !request.host_network {
        servers.retain(|s| !is_loopback(s));
    }
    if servers.is_empty() {
        servers = FALLBACK_NAMESERVERS.iter().map(|s| (*s).to_string()).collect();
    }

    let mut content = String::new();
    if !search.is_empty() {
        let _ = writeln!(content, "search {}", search.join(" "));
    }
    for server in &servers {
        let _ = writeln!(content, "nameserver {server}");
    }
    if !options.is_empty() {
        let _ = writeln!(content, "options {}", options.join(" "));
    }

    let path = request.bundle.join("resolv.conf");
    write_owned(&path, &content, request.owner)?;
    Ok(path)
}

fn is_loopback(server: &str) -> bool {
    server
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
