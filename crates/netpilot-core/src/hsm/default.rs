//! Root state: single-default-network behaviour and every command.

use tracing::{debug, info};

use super::message::Message;
use super::Disposition;
use crate::connectivity::Connectivity;
use crate::inet::InetDomain;
use crate::tracker::TrackerEvent;
use crate::types::{DetailedState, State};

pub(crate) fn handle(ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    let name = msg.name();
    match msg {
        Message::Tracker(TrackerEvent::StateChanged(info)) => {
            debug!(
                target: "hsm",
                "{} state {:?}/{:?}",
                info.network_type, info.state, info.detailed_state
            );
            if info.detailed_state == DetailedState::Failed {
                ctx.handle_connection_failure(info);
            } else if matches!(info.state, State::Disconnected | State::Suspended)
                && info.detailed_state != DetailedState::Idle
            {
                ctx.handle_disconnect(info);
            } else if info.state == State::Connected {
                ctx.handle_connect(info);
            }
        }
        Message::Tracker(TrackerEvent::ConfigurationChanged(info)) => {
            ctx.handle_connectivity_change(info.network_type, false);
        }
        Message::InetConditionChange {
            network_type,
            condition,
        } => {
            if ctx.active_default == Some(*network_type) {
                ctx.inet_report(InetDomain::Primary, *network_type, *condition);
            } else {
                debug!(
                    "Inet report for {} ignored, default is {:?}",
                    network_type, ctx.active_default
                );
            }
        }
        Message::InetConditionHoldEnd { domain, sequence } => {
            ctx.inet_hold_end(*domain, *sequence);
        }
        Message::SetNetworkPreference(preference) => {
            ctx.set_network_preference(*preference, true);
        }
        Message::RestoreDefaultNetwork { user_id } => {
            ctx.shared
                .features
                .stop_user(*user_id, false, &ctx.shared.trackers);
        }
        Message::SetMobileData(enabled) => ctx.set_mobile_data(*enabled, true),
        Message::SetPolicyDataEnable {
            network_type,
            enabled,
        } => {
            if let Some(tracker) = ctx.tracker(*network_type) {
                tracker.set_policy_data_enable(*enabled);
            }
        }
        Message::SetDependencyMet { network_type, met } => {
            if let Some(tracker) = ctx.tracker(*network_type) {
                tracker.set_dependency_met(*met);
            }
        }
        Message::ClearTransitionWakelock { serial } => {
            ctx.shared.wakelock.release(*serial);
        }
        Message::DnsConfigurationChange(network_type) => {
            ctx.handle_dns_configuration_change(*network_type);
        }
        Message::OverrideDns(dns) => {
            info!(target: "dns", "Dns overridden on {}: {:?}", dns.interface, dns.servers);
            let dns = dns.clone();
            // Publish first; the override flag blocks tracker-driven updates.
            ctx.update_dns(&dns.interface, &dns.servers, dns.domains.as_deref());
            ctx.shared.dns.set_override(Some(dns));
        }
        Message::RestoreDns => {
            ctx.shared.dns.set_override(None);
            if let Some(active) = ctx.active_default {
                ctx.handle_dns_configuration_change(active);
            }
        }
        Message::SetGlobalProxy(proxy) => ctx.set_global_proxy(proxy.take()),
        Message::SendBroadcast(broadcast) => ctx.send(broadcast.clone()),
        Message::RequestRouteToHost {
            network_type,
            address,
            pid,
            reply,
        } => {
            let ok = ctx.request_route_to_host(*network_type, *address, *pid);
            if let Some(reply) = reply.take() {
                let _ = reply.send(ok);
            }
        }
        Message::ProcessDied(pid) => {
            let released = ctx.process_died(*pid);
            if released > 0 {
                info!("Released {} requests of dead pid {}", released, pid);
            }
        }
        Message::ReloadSettings => ctx.reload_settings(),
        Message::StartFmc
        | Message::StopFmc
        | Message::SwitchConnectivity(_)
        | Message::ReprioritizeDns(_) => {
            debug!(target: "hsm", "{} ignored outside its variant", name);
        }
    }
    Disposition::Handled
}
