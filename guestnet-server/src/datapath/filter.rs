use anyhow::Result;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const BOTH: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("iptables"),
            IpFamily::V6 => f.write_str("ip6tables"),
        }
    }
}

/// Rule mutation in a named table and chain of the host packet filter.
pub trait PacketFilter {
    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()>;
    /// Insert at the head of `chain`
    fn insert(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()>;
    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()>;
    /// The `-C` check
    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool>;
    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()>;
    fn chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool>;
    /// Output of `-L -x -v -n` for `table`
    fn list_counters(&self, family: IpFamily, table: &str) -> Result<String>;
}

/// [`PacketFilter`] backed by the iptables/ip6tables binaries.
pub struct IptablesFilter {
    v4: iptables::IPTables,
    v6: iptables::IPTables,
}

impl IptablesFilter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            v4: ipt_new(false)?,
            v6: ipt_new(true)?,
        })
    }

    fn ipt(&self, family: IpFamily) -> &iptables::IPTables {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }
}

/// Convert the crate's `Box<dyn Error>` into anyhow
fn ipt_new(is_ipv6: bool) -> Result<iptables::IPTables> {
    iptables::new(is_ipv6).map_err(|e| anyhow::anyhow!("Failed to initialize iptables: {}", e))
}

fn ipt_err(family: IpFamily, op: &str, table: &str, chain: &str, rule: &str, e: &dyn fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("{} -t {} {} {} {} failed: {}", family, table, op, chain, rule, e)
}

impl PacketFilter for IptablesFilter {
    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.ipt(family)
            .append(table, chain, rule)
            .map_err(|e| ipt_err(family, "-A", table, chain, rule, &e))?;
        info!("{}: -t {} -A {} {}", family, table, chain, rule);
        Ok(())
    }

    fn insert(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.ipt(family)
            .insert(table, chain, rule, 1)
            .map_err(|e| ipt_err(family, "-I", table, chain, rule, &e))?;
        info!("{}: -t {} -I {} {}", family, table, chain, rule);
        Ok(())
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.ipt(family)
            .delete(table, chain, rule)
            .map_err(|e| ipt_err(family, "-D", table, chain, rule, &e))?;
        info!("{}: -t {} -D {} {}", family, table, chain, rule);
        Ok(())
    }

    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool> {
        self.ipt(family)
            .exists(table, chain, rule)
            .map_err(|e| ipt_err(family, "-C", table, chain, rule, &e))
    }

    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        self.ipt(family)
            .new_chain(table, chain)
            .map_err(|e| ipt_err(family, "-N", table, chain, "", &e))?;
        info!("{}: -t {} -N {}", family, table, chain);
        Ok(())
    }

    fn chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool> {
        self.ipt(family)
            .chain_exists(table, chain)
            .map_err(|e| ipt_err(family, "-L", table, chain, "", &e))
    }

    fn list_counters(&self, family: IpFamily, table: &str) -> Result<String> {
        let output = self
            .ipt(family)
            .execute(table, "-L -x -v -n")
            .map_err(|e| ipt_err(family, "-L", table, "", "-x -v -n", &e))?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} -t {} -L failed: {}",
                family,
                table,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
