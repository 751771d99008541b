use std::time::Duration;

use anyhow::bail;

/// Tunables of the forwarding core. All sizes are in bytes.
///
/// These values must be stable across the peers of an overlay: the client
/// PMTU negotiated with a remote assumes both sides budget the same
/// per-datagram overheads.
pub struct ForwarderConfig {
    /// Bytes the IP stack adds around a UDP payload: 20 bytes IPv4 header
    /// plus 8 bytes UDP header. Subtracted from a path MTU to obtain the
    /// usable datagram payload.
    ///
    /// NB: This assumes an option-less IPv4 header. Surprising network
    /// hardware may insert options on some routes; the PMTU verification
    /// mechanism absorbs that as a slightly smaller client PMTU.
    pub udp_overhead: usize,

    /// Size of an Ethernet frame header. The client PMTU counts only the
    /// Ethernet *body*, so this is subtracted whenever a whole frame is
    /// measured against it.
    pub ethernet_overhead: usize,

    /// Path MTU assumed before anything was discovered. Deliberately the
    /// IPv4 maximum: the first oversized send shrinks it to reality.
    pub default_pmtu: usize,

    /// Floor for the discovered client PMTU. The verification countdown and
    /// the `EMSGSIZE` recomputation never go below this.
    pub min_pmtu: usize,

    /// How long to wait for the remote to acknowledge a candidate client
    /// PMTU before lowering the candidate and probing again.
    pub pmtu_verify_timeout: Duration,

    /// Capacity of each forward queue. This is the only backpressure
    /// mechanism towards producers: a full queue blocks the caller of
    /// `forward` until the pipeline catches up.
    pub channel_size: usize,

    /// The overlay's well-known UDP port, used as the source port in the
    /// hand-built UDP header of the raw DF sender.
    pub port: u16,
}

impl ForwarderConfig {
    pub fn default_ipv4() -> ForwarderConfig {
        ForwarderConfig {
            udp_overhead: 20 + 8,
            ethernet_overhead: 14,
            default_pmtu: 65535,
            min_pmtu: 576,
            pmtu_verify_timeout: Duration::from_secs(10),
            channel_size: 16,
            port: 6783,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_size == 0 {
            bail!("forward queues need a capacity of at least one frame");
        }
        if self.min_pmtu <= self.udp_overhead + self.ethernet_overhead {
            bail!(
                "minimum PMTU of {} leaves no room for payload under {} bytes of UDP and Ethernet overhead",
                self.min_pmtu,
                self.udp_overhead + self.ethernet_overhead
            );
        }
        if self.default_pmtu < self.min_pmtu {
            bail!("default PMTU of {} is below the minimum PMTU of {}", self.default_pmtu, self.min_pmtu);
        }
        Ok(())
    }
}
