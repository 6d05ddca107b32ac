//! Generated /etc file tests.
//!
//! Validates hosts, hostname and resolv.conf generation and that the image's
//! own files are read but never modified.

use magikbuild::collaborators::HostEntry;
use magikbuild::etc::{DnsOptions, EtcRequest, add_host_entries, generate};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    tmp: TempDir,
    bundle: PathBuf,
    rootfs: PathBuf,
    resolv: PathBuf,
}

impl Fixture {
    fn new(host_resolv: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        let resolv = tmp.path().join("resolv.conf");
        std::fs::write(&resolv, host_resolv).unwrap();
        Self {
            tmp,
            bundle,
            rootfs,
            resolv,
        }
    }

    fn request<'a>(&'a self, hostname: &'a str, add_hosts: &'a [String], dns: &'a DnsOptions) -> EtcRequest<'a> {
        EtcRequest {
            bundle: &self.bundle,
            rootfs: &self.rootfs,
            hostname,
            add_hosts,
            dns,
            host_resolv_conf: &self.resolv,
            host_network: false,
            owner: owner(),
        }
    }
}

fn owner() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

// =============================================================================
// Hosts Tests
// =============================================================================

#[test]
fn test_hosts_from_image_with_additions() {
    let fixture = Fixture::new("nameserver 10.0.0.2\n");
    std::fs::write(fixture.rootfs.join("etc/hosts"), "127.0.0.1 localhost\n10.1.1.1 mirror").unwrap();
    let add_hosts = vec!["registry.local:10.2.2.2".to_string()];
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("builder", &add_hosts, &dns)).unwrap();

    let hosts = read(&files["/etc/hosts"]);
    assert!(hosts.starts_with("127.0.0.1 localhost\n10.1.1.1 mirror\n"), "image entries first");
    assert_eq!(hosts.matches("localhost").count(), 1, "localhost is not duplicated");
    assert!(hosts.contains("10.2.2.2\tregistry.local"));
    assert!(hosts.contains("127.0.1.1\tbuilder"));
    assert!(files["/etc/hosts"].starts_with(&fixture.bundle), "written into the bundle");
    assert_eq!(
        read(&fixture.rootfs.join("etc/hosts")),
        "127.0.0.1 localhost\n10.1.1.1 mirror",
        "image file is untouched"
    );
}

#[test]
fn test_hosts_without_image_file() {
    let fixture = Fixture::new("");
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("", &[], &dns)).unwrap();
    let hosts = read(&files["/etc/hosts"]);
    assert!(hosts.contains("127.0.0.1\tlocalhost"));
    assert!(hosts.contains("::1\tlocalhost"));
    assert!(!files.contains_key("/etc/hostname"), "no hostname without a UTS namespace");
}

#[test]
fn test_invalid_add_host_rejected() {
    let fixture = Fixture::new("");
    let add_hosts = vec!["no-separator".to_string()];
    let dns = DnsOptions::default();
    assert!(generate(&fixture.request("", &add_hosts, &dns)).is_err());
}

#[test]
fn test_add_host_entries_appends() {
    let fixture = Fixture::new("");
    let hosts = fixture.tmp.path().join("hosts");
    std::fs::write(&hosts, "127.0.0.1\tlocalhost\n").unwrap();
    add_host_entries(
        &hosts,
        &[HostEntry {
            ip: "10.88.0.5".to_string(),
            names: vec!["builder".to_string(), "builder.dns.podman".to_string()],
        }],
    )
    .unwrap();
    assert_eq!(read(&hosts), "127.0.0.1\tlocalhost\n10.88.0.5\tbuilder builder.dns.podman\n");
}

// =============================================================================
// Hostname Tests
// =============================================================================

#[test]
fn test_hostname_file() {
    let fixture = Fixture::new("");
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("0123456789ab", &[], &dns)).unwrap();
    assert_eq!(read(&files["/etc/hostname"]), "0123456789ab\n");
}

// =============================================================================
// Resolv.conf Tests
// =============================================================================

#[test]
fn test_resolv_conf_drops_loopback_servers() {
    let fixture = Fixture::new("search corp.example\nnameserver 127.0.0.53\nnameserver 10.0.0.2\noptions edns0\n");
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("", &[], &dns)).unwrap();
    assert_eq!(
        read(&files["/etc/resolv.conf"]),
        "search corp.example\nnameserver 10.0.0.2\noptions edns0\n"
    );
}

#[test]
fn test_resolv_conf_keeps_loopback_on_host_network() {
    let fixture = Fixture::new("nameserver 127.0.0.53\n");
    let dns = DnsOptions::default();
    let mut request = fixture.request("", &[], &dns);
    request.host_network = true;
    let files = generate(&request).unwrap();
    assert_eq!(read(&files["/etc/resolv.conf"]), "nameserver 127.0.0.53\n");
}

#[test]
fn test_resolv_conf_falls_back_to_public_servers() {
    let fixture = Fixture::new("nameserver 127.0.0.53\n");
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("", &[], &dns)).unwrap();
    assert_eq!(read(&files["/etc/resolv.conf"]), "nameserver 8.8.8.8\nnameserver 8.8.4.4\n");
}

#[test]
fn test_resolv_conf_overrides() {
    let fixture = Fixture::new("search corp.example\nnameserver 10.0.0.2\n");
    let dns = DnsOptions {
        servers: vec!["1.1.1.1".to_string()],
        search: vec![".".to_string()],
        options: vec!["ndots:2".to_string()],
    };
    let files = generate(&fixture.request("", &[], &dns)).unwrap();
    assert_eq!(
        read(&files["/etc/resolv.conf"]),
        "nameserver 1.1.1.1\noptions ndots:2\n",
        "'.' clears the search list"
    );
}

#[test]
fn test_missing_host_resolv_conf() {
    let fixture = Fixture::new("");
    std::fs::remove_file(&fixture.resolv).unwrap();
    let dns = DnsOptions::default();
    let files = generate(&fixture.request("", &[], &dns)).unwrap();
    assert!(read(&files["/etc/resolv.conf"]).contains("nameserver 8.8.8.8"));
}
