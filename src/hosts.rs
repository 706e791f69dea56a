//! Block-hosts file loading.
//!
//! Accepts either one host per line or `/etc/hosts` format (`IP host
//! [host...]`). `#` starts a comment. Lines with two or more fields are
//! treated as `/etc/hosts` entries: the first field is an IP and only the
//! remaining fields are taken as hosts.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::headers::has_any_fold;

/// Parse hosts out of `r`, one per line or in `/etc/hosts` format.
pub fn load_hosts<R: Read>(r: R) -> io::Result<Vec<String>> {
    let mut hosts = Vec::new();
    for line in BufReader::new(r).lines() {
        let line = line?;
        let mut ent = line.trim();
        if let Some(ihash) = ent.find('#') {
            ent = ent[..ihash].trim();
        }
        if ent.is_empty() {
            continue;
        }
        let parts: Vec<&str> = ent.split_whitespace().collect();
        match parts.len() {
            0 => {}
            1 => hosts.push(parts[0].to_string()),
            _ => {
                // /etc/hosts format, first field is the IP
                for host in &parts[1..] {
                    hosts.push((*host).to_string());
                }
            }
        }
    }
    Ok(hosts)
}

/// Load hosts from a file, see [`load_hosts`].
pub fn load_hosts_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<String>> {
    load_hosts(File::open(path)?)
}

/// Returns true if `host` is in `hosts`, compared case-insensitively.
pub fn contains_host(hosts: &[String], host: &str) -> bool {
    has_any_fold(hosts, host)
}
