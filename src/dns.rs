use dns_lookup::lookup_host;
use std::net::IpAddr;

pub async fn resolve_hostname(hostname: &str, force_ipv4: bool, force_ipv6: bool) -> anyhow::Result<IpAddr> {
    // First try to parse as IP address
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        match (ip, force_ipv4, force_ipv6) {
            (IpAddr::V4(_), false, true) => {
                return Err(anyhow::anyhow!("IPv4 address provided but IPv6 forced"));
            }
            (IpAddr::V6(_), true, false) => {
                return Err(anyhow::anyhow!("IPv6 address provided but IPv4 forced"));
            }
            _ => return Ok(ip),
        }
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup_host(&hostname)
    })
    .await??;

    let filtered: Vec<IpAddr> = addresses
        .into_iter()
        .filter(|addr| match (addr, force_ipv4, force_ipv6) {
            (IpAddr::V4(_), false, true) => false,
            (IpAddr::V6(_), true, false) => false,
            _ => true,
        })
        .collect();

    if filtered.is_empty() {
        let version = match (force_ipv4, force_ipv6) {
            (true, _) => "IPv4 ",
            (_, true) => "IPv6 ",
            _ => "",
        };
        return Err(anyhow::anyhow!("No {}addresses found for hostname: {}", version, hostname));
    }

    // Prefer IPv4 unless IPv6 is forced
    let preferred = if force_ipv6 {
        filtered.iter().find(|addr| addr.is_ipv6())
    } else {
        filtered.iter().find(|addr| addr.is_ipv4())
    };

    preferred
        .or_else(|| filtered.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No suitable address found"))
}

/// Resolve every target, keeping the name it was given as.
pub async fn resolve_targets(
    targets: &[String],
    force_ipv4: bool,
    force_ipv6: bool,
) -> anyhow::Result<Vec<(String, IpAddr)>> {
    let mut resolved = Vec::with_capacity(targets.len());
    for target in targets {
        let ip = resolve_hostname(target, force_ipv4, force_ipv6)
            .await
            .map_err(|e| anyhow::anyhow!("cannot resolve '{}': {}", target, e))?;
        resolved.push((target.clone(), ip));
    }
    Ok(resolved)
}
