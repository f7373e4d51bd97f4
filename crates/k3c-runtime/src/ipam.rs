//! Address allocation for managed cluster networks.
//!
//! Docker networks cannot be relabelled after creation, so the used-address
//! set is kept in-process, seeded from a live `network inspect` on every
//! allocation and mutated only under a per-pool lock. Allocation is
//! deterministic: the lowest free host address above the gateway wins.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};

/// Per-network address bookkeeping.
#[derive(Default)]
pub(crate) struct IpamPool {
    used: Mutex<HashMap<String, HashSet<IpAddr>>>,
}

impl IpamPool {
    /// Reserves the next free address on `network`.
    ///
    /// `live_used` is the address set read from the runtime immediately
    /// before the call; the reservation only succeeds against the merged
    /// view, which gives compare-and-swap semantics for concurrent
    /// allocations in this process.
    pub(crate) async fn allocate(
        &self,
        network: &str,
        subnet: &IpNetwork,
        gateway: Option<IpAddr>,
        live_used: &HashSet<IpAddr>,
    ) -> Result<IpAddr> {
        let mut pools = self.used.lock().await;
        let pool = pools.entry(network.to_string()).or_default();
        pool.extend(live_used.iter().copied());

        let ip = next_free(subnet, gateway, pool)?;
        pool.insert(ip);
        Ok(ip)
    }

    /// Returns an address to the pool.
    pub(crate) async fn release(&self, network: &str, ip: IpAddr) {
        let mut pools = self.used.lock().await;
        if let Some(pool) = pools.get_mut(network) {
            pool.remove(&ip);
        }
    }
}

/// Picks the lowest free host address in `subnet`, skipping the network
/// address, the gateway and (for IPv4) the broadcast address.
fn next_free(
    subnet: &IpNetwork,
    gateway: Option<IpAddr>,
    used: &HashSet<IpAddr>,
) -> Result<IpAddr> {
    let network_addr = subnet.network();
    let broadcast = match subnet {
        IpNetwork::V4(net) => Some(IpAddr::V4(net.broadcast())),
        IpNetwork::V6(_) => None,
    };

    subnet
        .iter()
        .find(|ip| {
            *ip != network_addr
                && Some(*ip) != gateway
                && Some(*ip) != broadcast
                && !used.contains(ip)
        })
        .ok_or_else(|| RuntimeError::SubnetExhausted(subnet.to_string()))
}
