//! NIC configuration for the gvproxy networking mode.
//!
//! The host's VMM starts gvproxy handing this guest a single `eth0` with a
//! statically assigned address; there is no DHCP client in the guest image.
//! Configuration is driven entirely by `AEGIS_NET_IP` (CIDR, e.g.
//! `192.168.127.2/24`) and `AEGIS_NET_GATEWAY`. Both are optional: a harness
//! booted without networking (a pure batch job) simply skips this step.

use crate::klog::{fatal, log};

#[cfg(target_os = "linux")]
pub async fn configure_if_requested() {
    let Some(cidr) = crate::env::lookup("AEGIS_NET_IP") else {
        log("no AEGIS_NET_IP set, skipping network configuration");
        return;
    };

    if let Err(e) = configure(&cidr, crate::env::lookup("AEGIS_NET_GATEWAY")).await {
        fatal(&format!("network configuration failed: {e}"));
    }
}

#[cfg(target_os = "linux")]
async fn configure(cidr: &str, gateway: Option<String>) -> Result<(), String> {
    use futures::TryStreamExt;
    use rtnetlink::new_connection;

    let (addr, prefix_len) = parse_cidr(cidr)?;

    let (connection, handle, _) = new_connection().map_err(|e| e.to_string())?;
    tokio::spawn(connection);

    let mut links = handle.link().get().match_name("eth0".to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no eth0 interface found".to_string())?;
    let index = link.header.index;

    handle
        .address()
        .add(index, addr, prefix_len)
        .execute()
        .await
        .map_err(|e| e.to_string())?;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| e.to_string())?;

    if let Some(gw) = gateway {
        let gw_addr: std::net::IpAddr = gw.parse().map_err(|_| format!("invalid gateway {gw}"))?;
        handle
            .route()
            .add()
            .v4()
            .gateway(match gw_addr {
                std::net::IpAddr::V4(v4) => v4,
                std::net::IpAddr::V6(_) => return Err("IPv6 gateway not supported".into()),
            })
            .execute()
            .await
            .map_err(|e| e.to_string())?;
    }

    log(&format!("eth0 configured with {cidr}"));
    Ok(())
}

#[cfg(target_os = "linux")]
fn parse_cidr(cidr: &str) -> Result<(std::net::IpAddr, u8), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("AEGIS_NET_IP {cidr} is not in CIDR form"))?;
    let addr: std::net::IpAddr = addr.parse().map_err(|_| format!("invalid address {addr}"))?;
    let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix {prefix}"))?;
    Ok((addr, prefix))
}

#[cfg(not(target_os = "linux"))]
pub async fn configure_if_requested() {
    if crate::env::lookup("AEGIS_NET_IP").is_some() {
        fatal("network configuration requested but this platform has no netlink support");
    }
}
