use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use netpilot_core::{DnsOverride, NetworkType, ProxyInfo, UidRule};
use serde_json::{json, Value};

use crate::{ClientConfig, DaemonClient};

#[derive(Parser, Debug)]
#[command(
    name = "netpilotctl",
    author,
    version,
    about = "Query and steer the netpilotd connectivity daemon"
)]
pub struct Cli {
    /// Daemon socket path
    #[arg(long, global = true, env = "NETPILOTD_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Output format for command responses
    #[arg(
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Text,
        global = true
    )]
    pub output_format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Daemon liveness
    Health,
    /// Daemon and protocol versions
    Version,
    /// Controller state and the current default network
    Status,
    /// Full controller snapshot
    Snapshot,
    #[command(subcommand)]
    Network(NetworkCommand),
    #[command(subcommand)]
    Preference(PreferenceCommand),
    #[command(subcommand)]
    Feature(FeatureCommand),
    /// Ask for a host route through a network type
    RouteToHost(RouteToHostArgs),
    #[command(subcommand)]
    Data(DataCommand),
    #[command(subcommand)]
    Wakelock(WakelockCommand),
    #[command(subcommand)]
    Radio(RadioCommand),
    #[command(subcommand)]
    Proxy(ProxyCommand),
    #[command(subcommand)]
    UidRule(UidRuleCommand),
    #[command(subcommand)]
    Fmc(FmcCommand),
    /// Make a network type the default
    Switch(NetworkTypeArgs),
    #[command(subcommand)]
    Dns(DnsCommand),
    /// Re-read settings.json
    ReloadSettings,
    /// Report that a process exited so its requests are released
    ProcessDied(ProcessDiedArgs),
    /// Recently published broadcasts, oldest first
    Broadcasts(BroadcastsArgs),
    /// Kernel routing table as netlink reports it
    KernelRoutes,
    #[command(subcommand)]
    Logging(LoggingCommand),
}

#[derive(Args, Debug, Clone, Copy)]
pub struct NetworkTypeArgs {
    /// Network type name (wifi, mobile_dun, ...) or number
    #[arg(value_parser = parse_network_type)]
    pub network_type: NetworkType,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Info for the default network
    Active,
    /// Info for one network type
    Info(NetworkTypeArgs),
    /// Info for every tracked network
    List,
    /// Link properties; the default network's when no type is given
    Link {
        #[arg(value_parser = parse_network_type)]
        network_type: Option<NetworkType>,
    },
    /// Whether the default network is metered
    Metered,
    /// Whether a tracker serves this type
    Supported(NetworkTypeArgs),
}

#[derive(Subcommand, Debug)]
pub enum PreferenceCommand {
    Get,
    Set(NetworkTypeArgs),
}

#[derive(Args, Debug)]
pub struct FeatureArgs {
    #[arg(value_parser = parse_network_type)]
    pub network_type: NetworkType,
    /// Feature name, e.g. enableMMS or enableHIPRI
    pub feature: String,
}

#[derive(Subcommand, Debug)]
pub enum FeatureCommand {
    Start(FeatureArgs),
    Stop(FeatureArgs),
    /// Outstanding feature requests
    Users,
}

#[derive(Args, Debug)]
pub struct RouteToHostArgs {
    #[arg(value_parser = parse_network_type)]
    pub network_type: NetworkType,
    pub address: IpAddr,
}

#[derive(Subcommand, Debug)]
pub enum DataCommand {
    /// Mobile data master switch
    Mobile {
        #[arg(long, value_parser = parse_on_off)]
        set: Option<bool>,
    },
    /// Policy allowance for one network type
    Policy {
        #[arg(value_parser = parse_network_type)]
        network_type: NetworkType,
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Report internet reachability (0-100) for a network type
    InetCondition {
        #[arg(value_parser = parse_network_type)]
        network_type: NetworkType,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percentage: u8,
    },
    /// Mark a network type's data dependency met or unmet
    Dependency {
        #[arg(value_parser = parse_network_type)]
        network_type: NetworkType,
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        met: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum WakelockCommand {
    /// Hold the transition wakelock on behalf of `for_what`
    Request { for_what: String },
    Status,
}

#[derive(Subcommand, Debug)]
pub enum RadioCommand {
    /// Every radio at once
    All {
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        on: bool,
    },
    /// One network type's radio
    Set {
        #[arg(value_parser = parse_network_type)]
        network_type: NetworkType,
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        on: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    /// The global proxy, if any
    Global,
    /// Set the global proxy
    Set {
        host: String,
        port: u16,
        #[arg(long)]
        exclusion_list: Option<String>,
    },
    /// Remove the global proxy
    Clear,
    /// The proxy applications should use
    Effective,
}

#[derive(Subcommand, Debug)]
pub enum UidRuleCommand {
    Get {
        uid: u32,
    },
    Set {
        uid: u32,
        #[arg(value_parser = parse_uid_rule)]
        rule: UidRule,
    },
}

#[derive(Subcommand, Debug)]
pub enum FmcCommand {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand, Debug)]
pub enum DnsCommand {
    /// Published resolver configuration
    Get,
    /// Pin resolvers until restored
    Override {
        interface: String,
        #[arg(required = true)]
        servers: Vec<IpAddr>,
        #[arg(long)]
        domains: Option<String>,
    },
    /// Drop an override and republish the active network's resolvers
    Restore,
    /// Put a network type's resolvers first
    Reprioritize(NetworkTypeArgs),
}

#[derive(Args, Debug)]
pub struct ProcessDiedArgs {
    pub pid: u32,
}

#[derive(Args, Debug)]
pub struct BroadcastsArgs {
    #[arg(long, default_value_t = 32)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum LoggingCommand {
    Get,
    Set {
        #[arg(
            long,
            value_parser = parse_on_off,
            action = clap::ArgAction::Set,
            default_value = "on"
        )]
        enabled: bool,
        /// EnvFilter directive, e.g. "info,route=debug"
        #[arg(long, default_value = "info")]
        level: String,
    },
}

fn parse_network_type(value: &str) -> Result<NetworkType, String> {
    value.parse::<NetworkType>().map_err(|err| err.to_string())
}

fn parse_on_off(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" | "enable" | "enabled" => Ok(true),
        "off" | "false" | "0" | "no" | "disable" | "disabled" => Ok(false),
        other => Err(format!("expected on or off, got {other}")),
    }
}

fn parse_uid_rule(value: &str) -> Result<UidRule, String> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "allow" => Ok(UidRule::Allow),
        "reject_metered" => Ok(UidRule::RejectMetered),
        other => Err(format!("unknown uid rule {other}")),
    }
}

/// Runs one command against the daemon and returns the message and payload
/// to print.
pub async fn dispatch_command(cli: Cli) -> Result<(String, Value)> {
    let mut config = ClientConfig {
        client_name: "netpilotctl".to_string(),
        ..ClientConfig::default()
    };
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    let mut client = DaemonClient::connect_with_config(config).await?;

    let out = match cli.command {
        Commands::Health => {
            let resp = client.health().await?;
            (resp.message.clone(), json!(resp))
        }
        Commands::Version => {
            let resp = client.version().await?;
            (format!("netpilotd {}", resp.daemon_version), json!(resp))
        }
        Commands::Status => {
            let resp = client.status().await?;
            let message = match resp.active_default {
                Some(active) => format!("{:?}, default network {}", resp.state, active),
                None => format!("{:?}, no default network", resp.state),
            };
            (message, json!(resp))
        }
        Commands::Snapshot => ("snapshot".to_string(), json!(client.snapshot().await?)),
        Commands::Network(cmd) => network(&mut client, cmd).await?,
        Commands::Preference(PreferenceCommand::Get) => {
            let preferred = client.network_preference().await?;
            (format!("preferred network {}", preferred), json!(preferred))
        }
        Commands::Preference(PreferenceCommand::Set(args)) => {
            ack(client.set_network_preference(args.network_type).await?)
        }
        Commands::Feature(FeatureCommand::Start(args)) => {
            let resp = client
                .start_using_network_feature(args.network_type, &args.feature)
                .await?;
            (format!("{:?} (code {})", resp.result, resp.code), json!(resp))
        }
        Commands::Feature(FeatureCommand::Stop(args)) => {
            let resp = client
                .stop_using_network_feature(args.network_type, &args.feature)
                .await?;
            (format!("{:?}", resp.result), json!(resp))
        }
        Commands::Feature(FeatureCommand::Users) => {
            let users = client.feature_users().await?;
            (format!("{} feature request(s)", users.len()), json!(users))
        }
        Commands::RouteToHost(args) => {
            let added = client
                .request_route_to_host(args.network_type, args.address)
                .await?;
            if !added {
                bail!("route to {} via {} refused", args.address, args.network_type);
            }
            (
                format!("route to {} via {} installed", args.address, args.network_type),
                json!(added),
            )
        }
        Commands::Data(cmd) => data(&mut client, cmd).await?,
        Commands::Wakelock(WakelockCommand::Request { for_what }) => {
            let granted = client.request_network_transition_wakelock(&for_what).await?;
            (
                if granted { "wakelock held" } else { "wakelock not granted" }.to_string(),
                json!(granted),
            )
        }
        Commands::Wakelock(WakelockCommand::Status) => {
            let status = client.wakelock_status().await?;
            (
                if status.held { "held" } else { "released" }.to_string(),
                json!(status),
            )
        }
        Commands::Radio(RadioCommand::All { on }) => {
            let ok = client.set_radios(on).await?;
            (format!("radios {}", on_off(on)), json!(ok))
        }
        Commands::Radio(RadioCommand::Set { network_type, on }) => {
            let ok = client.set_radio(network_type, on).await?;
            (format!("{} radio {}", network_type, on_off(on)), json!(ok))
        }
        Commands::Proxy(cmd) => proxy(&mut client, cmd).await?,
        Commands::UidRule(UidRuleCommand::Get { uid }) => {
            let rule = client.uid_rule(uid).await?;
            (format!("uid {}: {:?}", uid, rule), json!(rule))
        }
        Commands::UidRule(UidRuleCommand::Set { uid, rule }) => {
            let rule = client.set_uid_rule(uid, rule).await?;
            (format!("uid {}: {:?}", uid, rule), json!(rule))
        }
        Commands::Fmc(FmcCommand::Start) => ack(client.start_fmc().await?),
        Commands::Fmc(FmcCommand::Stop) => ack(client.stop_fmc().await?),
        Commands::Fmc(FmcCommand::Status) => {
            let status = client.fmc_status().await?;
            (format!("{:?}", status), json!(status))
        }
        Commands::Switch(args) => ack(client.switch_connectivity(args.network_type).await?),
        Commands::Dns(cmd) => dns(&mut client, cmd).await?,
        Commands::ReloadSettings => ack(client.reload_settings().await?),
        Commands::ProcessDied(args) => ack(client.process_died(args.pid).await?),
        Commands::Broadcasts(args) => {
            let records = client.recent_broadcasts(args.limit).await?;
            (format!("{} broadcast(s)", records.len()), json!(records))
        }
        Commands::KernelRoutes => {
            let routes = client.kernel_routes().await?;
            (format!("{} route(s)", routes.len()), json!(routes))
        }
        Commands::Logging(LoggingCommand::Get) => {
            let cfg = client.logging_config().await?;
            (format!("logging {} at {}", on_off(cfg.enabled), cfg.level), json!(cfg))
        }
        Commands::Logging(LoggingCommand::Set { enabled, level }) => {
            let cfg = client.set_logging_config(enabled, &level).await?;
            (format!("logging {} at {}", on_off(cfg.enabled), cfg.level), json!(cfg))
        }
    };
    Ok(out)
}

async fn network(client: &mut DaemonClient, cmd: NetworkCommand) -> Result<(String, Value)> {
    Ok(match cmd {
        NetworkCommand::Active => {
            let info = client.active_network_info().await?;
            let message = match &info {
                Some(info) => format!("{} {:?}", info.network_type, info.state),
                None => "no active network".to_string(),
            };
            (message, json!(info))
        }
        NetworkCommand::Info(args) => {
            let info = client.network_info(args.network_type).await?;
            let message = match &info {
                Some(info) => format!("{} {:?}", info.network_type, info.state),
                None => format!("{} is not tracked", args.network_type),
            };
            (message, json!(info))
        }
        NetworkCommand::List => {
            let networks = client.all_network_info().await?;
            (format!("{} network(s)", networks.len()), json!(networks))
        }
        NetworkCommand::Link { network_type } => {
            let link = match network_type {
                Some(t) => client.link_properties(t).await?,
                None => client.active_link_properties().await?,
            };
            let message = link
                .as_ref()
                .and_then(|lp| lp.interface())
                .map(|iface| format!("link on {}", iface))
                .unwrap_or_else(|| "no link".to_string());
            (message, json!(link))
        }
        NetworkCommand::Metered => {
            let metered = client.is_active_network_metered().await?;
            (
                if metered { "metered" } else { "not metered" }.to_string(),
                json!(metered),
            )
        }
        NetworkCommand::Supported(args) => {
            let supported = client.is_network_supported(args.network_type).await?;
            (
                format!(
                    "{} is {}supported",
                    args.network_type,
                    if supported { "" } else { "not " }
                ),
                json!(supported),
            )
        }
    })
}

async fn data(client: &mut DaemonClient, cmd: DataCommand) -> Result<(String, Value)> {
    Ok(match cmd {
        DataCommand::Mobile { set: None } => {
            let enabled = client.mobile_data_enabled().await?;
            (format!("mobile data {}", on_off(enabled)), json!(enabled))
        }
        DataCommand::Mobile { set: Some(enabled) } => {
            ack(client.set_mobile_data_enabled(enabled).await?)
        }
        DataCommand::Policy {
            network_type,
            enabled,
        } => ack(client.set_policy_data_enable(network_type, enabled).await?),
        DataCommand::InetCondition {
            network_type,
            percentage,
        } => ack(client.report_inet_condition(network_type, percentage).await?),
        DataCommand::Dependency { network_type, met } => {
            ack(client.set_data_dependency(network_type, met).await?)
        }
    })
}

async fn proxy(client: &mut DaemonClient, cmd: ProxyCommand) -> Result<(String, Value)> {
    Ok(match cmd {
        ProxyCommand::Global => describe_proxy(client.global_proxy().await?),
        ProxyCommand::Effective => describe_proxy(client.proxy().await?),
        ProxyCommand::Set {
            host,
            port,
            exclusion_list,
        } => {
            let proxy = ProxyInfo {
                host,
                port,
                exclusion_list,
            };
            ack(client.set_global_proxy(Some(proxy)).await?)
        }
        ProxyCommand::Clear => ack(client.set_global_proxy(None).await?),
    })
}

async fn dns(client: &mut DaemonClient, cmd: DnsCommand) -> Result<(String, Value)> {
    Ok(match cmd {
        DnsCommand::Get => {
            let snapshot = client.dns().await?;
            let servers: Vec<String> = snapshot.servers.iter().map(|s| s.to_string()).collect();
            (
                format!(
                    "{}{}",
                    servers.join(" "),
                    if snapshot.overridden { " (override)" } else { "" }
                ),
                json!(snapshot),
            )
        }
        DnsCommand::Override {
            interface,
            servers,
            domains,
        } => ack(
            client
                .override_dns(DnsOverride {
                    interface,
                    servers,
                    domains,
                })
                .await?,
        ),
        DnsCommand::Restore => ack(client.restore_dns().await?),
        DnsCommand::Reprioritize(args) => ack(client.reprioritize_dns(args.network_type).await?),
    })
}

fn describe_proxy(proxy: Option<ProxyInfo>) -> (String, Value) {
    let message = match &proxy {
        Some(p) => format!("{}:{}", p.host, p.port),
        None => "no proxy".to_string(),
    };
    (message, json!(proxy))
}

fn ack(resp: netpilot_ipc::AckResponse) -> (String, Value) {
    (resp.message.clone(), json!(resp))
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_types_parse_by_name_and_number() {
        let cli = Cli::try_parse_from(["netpilotctl", "preference", "set", "wifi"]).unwrap();
        match cli.command {
            Commands::Preference(PreferenceCommand::Set(args)) => {
                assert_eq!(args.network_type, NetworkType::WIFI)
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["netpilotctl", "switch", "9"]).unwrap();
        match cli.command {
            Commands::Switch(args) => assert_eq!(args.network_type, NetworkType::ETHERNET),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["netpilotctl", "switch", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn inet_condition_is_bounded() {
        assert!(
            Cli::try_parse_from(["netpilotctl", "data", "inet-condition", "wifi", "100"]).is_ok()
        );
        assert!(
            Cli::try_parse_from(["netpilotctl", "data", "inet-condition", "wifi", "101"]).is_err()
        );
    }

    #[test]
    fn on_off_and_uid_rules() {
        assert_eq!(parse_on_off("Enabled"), Ok(true));
        assert_eq!(parse_on_off("off"), Ok(false));
        assert!(parse_on_off("maybe").is_err());
        assert_eq!(parse_uid_rule("reject-metered"), Ok(UidRule::RejectMetered));
        assert_eq!(parse_uid_rule("allow"), Ok(UidRule::Allow));
    }

    #[test]
    fn dns_override_needs_a_server() {
        assert!(Cli::try_parse_from(["netpilotctl", "dns", "override", "wlan0"]).is_err());
        let cli = Cli::try_parse_from([
            "netpilotctl",
            "dns",
            "override",
            "wlan0",
            "1.1.1.1",
            "9.9.9.9",
        ])
        .unwrap();
        match cli.command {
            Commands::Dns(DnsCommand::Override { servers, .. }) => assert_eq!(servers.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
