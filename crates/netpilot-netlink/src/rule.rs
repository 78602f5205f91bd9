//! Source-address policy rules: traffic from a local address is looked up in
//! that network's own routing table.

use crate::error::{NetlinkError, Result};
use futures::stream::TryStreamExt;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::IpAddr;

/// Rule priority used for every source rule; below the kernel's `main` rule.
pub const SOURCE_RULE_PRIORITY: u32 = 10_000;

pub struct RuleManager {
    handle: Handle,
}

impl RuleManager {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = new_connection().map_err(|e| {
            NetlinkError::runtime(
                "creating netlink connection for rule management",
                e.to_string(),
            )
        })?;

        tokio::spawn(connection);

        Ok(Self { handle })
    }

    /// Installs `from <source> lookup <table>`, dropping any earlier copy first.
    pub async fn replace_source_rule(&self, source: IpAddr, table: u32) -> Result<()> {
        self.delete_source_rule(source, table).await?;

        let add_error = |e: rtnetlink::Error| NetlinkError::RuleError {
            operation: "add".to_string(),
            source_addr: source.to_string(),
            table,
            reason: e.to_string(),
        };
        match source {
            IpAddr::V4(_) => {
                let mut req = self.handle.rule().add().v4();
                fill_source_rule(req.message_mut(), source, table);
                req.execute().await.map_err(add_error)?;
            }
            IpAddr::V6(_) => {
                let mut req = self.handle.rule().add().v6();
                fill_source_rule(req.message_mut(), source, table);
                req.execute().await.map_err(add_error)?;
            }
        }

        tracing::debug!(target: "route", "Added rule from {} lookup {}", source, table);
        Ok(())
    }

    /// Removes every `from <source> lookup <table>` rule. Absent rules are fine.
    pub async fn delete_source_rule(&self, source: IpAddr, table: u32) -> Result<()> {
        let version = match source {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        };
        let mut rules = self.handle.rule().get(version).execute();
        let mut stale = Vec::new();

        while let Some(rule) = rules.try_next().await.map_err(|e| NetlinkError::RuleError {
            operation: "list".to_string(),
            source_addr: source.to_string(),
            table,
            reason: e.to_string(),
        })? {
            if is_source_rule(&rule, source, table) {
                stale.push(rule);
            }
        }

        for rule in stale {
            self.handle
                .rule()
                .del(rule)
                .execute()
                .await
                .map_err(|e| NetlinkError::RuleError {
                    operation: "delete".to_string(),
                    source_addr: source.to_string(),
                    table,
                    reason: e.to_string(),
                })?;
            tracing::debug!(target: "route", "Deleted rule from {} lookup {}", source, table);
        }
        Ok(())
    }
}

fn fill_source_rule(message: &mut RuleMessage, source: IpAddr, table: u32) {
    message.header.src_len = host_prefix_len(&source);
    message.header.action = RuleAction::ToTable;
    message.header.table = u8::try_from(table).unwrap_or(0);
    message.attributes.push(RuleAttribute::Source(source));
    message.attributes.push(RuleAttribute::Table(table));
    message
        .attributes
        .push(RuleAttribute::Priority(SOURCE_RULE_PRIORITY));
}

fn host_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn rule_table(rule: &RuleMessage) -> u32 {
    rule.attributes
        .iter()
        .find_map(|nla| match nla {
            RuleAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(u32::from(rule.header.table))
}

fn is_source_rule(rule: &RuleMessage, source: IpAddr, table: u32) -> bool {
    let has_source = rule
        .attributes
        .iter()
        .any(|nla| matches!(nla, RuleAttribute::Source(addr) if *addr == source));
    has_source && rule.header.src_len == host_prefix_len(&source) && rule_table(rule) == table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn filled_rule_is_recognised() {
        let source = IpAddr::V4(Ipv4Addr::new(10, 64, 0, 7));
        let mut rule = RuleMessage::default();
        fill_source_rule(&mut rule, source, 1001);

        assert!(is_source_rule(&rule, source, 1001));
        assert!(!is_source_rule(&rule, source, 1002));
        assert!(!is_source_rule(
            &rule,
            IpAddr::V4(Ipv4Addr::new(10, 64, 0, 8)),
            1001
        ));
    }

    #[test]
    fn small_tables_fit_the_header() {
        let source = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let mut rule = RuleMessage::default();
        fill_source_rule(&mut rule, source, 101);
        assert_eq!(rule.header.table, 101);
        assert_eq!(rule_table(&rule), 101);
    }
}
