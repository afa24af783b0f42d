//! Controller address resolution.
//!
//! Tried in order: the fixed USB address when USB mode is on, an mDNS
//! browse for `roboRIO-<team>-FRC.local`, then the static `10.TE.AM.2`
//! fallback derived from the team number. The static fallback always
//! resolves, so the send loop is never left without a target.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// USB-emulated network link address.
pub const USB_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 22, 11, 2));

/// Static controller address for a team: `10.TE.AM.2`.
pub fn team_address(team: u16) -> IpAddr {
    let te = (team / 100) as u8;
    let am = (team % 100) as u8;
    IpAddr::V4(Ipv4Addr::new(10, te, am, 2))
}

/// mDNS hostname advertised by the controller.
pub fn mdns_hostname(team: u16) -> String {
    format!("roboRIO-{team}-FRC.local")
}

/// Resolve the controller address. Infallible: falls through to the static
/// address when discovery finds nothing within `resolve_timeout`.
pub async fn resolve(team: u16, use_usb: bool, resolve_timeout: Duration) -> IpAddr {
    if use_usb {
        info!("USB mode, using {USB_ADDR}");
        return USB_ADDR;
    }

    let hostname = mdns_hostname(team);
    debug!("Browsing mDNS for {hostname}");
    if let Some(addr) = mdns_lookup(team, resolve_timeout).await {
        info!("Resolved {hostname} via mDNS: {addr}");
        return addr;
    }

    let fallback = team_address(team);
    info!("mDNS found nothing, falling back to {fallback}");
    fallback
}

async fn mdns_lookup(team: u16, resolve_timeout: Duration) -> Option<IpAddr> {
    let result = timeout(resolve_timeout, async {
        let daemon = match mdns_sd::ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!("mDNS daemon unavailable: {e}");
                return None;
            }
        };

        let receiver = match daemon.browse("_ni._tcp.local.") {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("mDNS browse failed: {e}");
                return None;
            }
        };

        let deadline = Instant::now() + resolve_timeout;
        while Instant::now() < deadline {
            let event = timeout(Duration::from_millis(100), receiver.recv_async()).await;
            if let Ok(Ok(mdns_sd::ServiceEvent::ServiceResolved(info))) = event {
                if info.get_fullname().contains(&team.to_string()) {
                    if let Some(addr) = info.get_addresses().iter().next() {
                        return Some(*addr);
                    }
                }
            }
        }
        None
    })
    .await;

    result.ok().flatten()
}

/// Exponential backoff: `initial * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    initial
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_address_derivation() {
        assert_eq!(team_address(1234).to_string(), "10.12.34.2");
        assert_eq!(team_address(9).to_string(), "10.0.9.2");
        assert_eq!(team_address(254).to_string(), "10.2.54.2");
        assert_eq!(team_address(9999).to_string(), "10.99.99.2");
        assert_eq!(team_address(0).to_string(), "10.0.0.2");
    }

    #[test]
    fn usb_address_is_fixed() {
        assert_eq!(USB_ADDR.to_string(), "172.22.11.2");
    }

    #[test]
    fn hostname_format() {
        assert_eq!(mdns_hostname(100), "roboRIO-100-FRC.local");
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let initial = Duration::from_millis(100);
        let cap = Duration::from_millis(2000);
        assert_eq!(backoff_delay(0, initial, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, initial, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, initial, cap), Duration::from_millis(400));
        assert_eq!(backoff_delay(3, initial, cap), Duration::from_millis(800));
        assert_eq!(backoff_delay(4, initial, cap), Duration::from_millis(1600));
        assert_eq!(backoff_delay(5, initial, cap), Duration::from_millis(2000));
        assert_eq!(backoff_delay(30, initial, cap), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn usb_mode_short_circuits() {
        let addr = resolve(1234, true, Duration::from_millis(1)).await;
        assert_eq!(addr, USB_ADDR);
    }
}
