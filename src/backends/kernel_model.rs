// In-memory model of kernel shaping state, used by tests

use super::{MacMatch, RuleExecutor, TcCommand};
use anyhow::{Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFilter {
    pub mac: String,
    pub matches: MacMatch,
    pub minor: u16,
}

#[derive(Debug, Clone, Default)]
struct LinkState {
    ifb: bool,
    root_qdisc: bool,
    ingress_qdisc: bool,
    redirect: Option<String>,
    classes: BTreeMap<u16, (u16, String)>, // minor -> (parent, rate)
    leaf_qdiscs: BTreeSet<u16>,
    filters: BTreeMap<u16, Vec<ModelFilter>>, // prio -> filters
}

impl LinkState {
    fn clear_root(&mut self) {
        self.root_qdisc = false;
        self.classes.clear();
        self.leaf_qdiscs.clear();
        self.filters.clear();
    }

    fn clear_ingress(&mut self) {
        self.ingress_qdisc = false;
        self.redirect = None;
    }
}

type FailurePredicate = Box<dyn FnMut(&TcCommand) -> bool + Send>;

/// Executor that applies tc add/replace/delete semantics to an in-memory
/// model instead of the kernel
///
/// Physical links must be declared up front; IFB links come and go through
/// the commands themselves. Failures can be injected per command.
pub struct KernelModel {
    links: BTreeMap<String, LinkState>,
    history: Vec<TcCommand>,
    failures: Vec<FailurePredicate>,
}

impl KernelModel {
    pub fn with_links(names: &[&str]) -> Self {
        Self {
            links: names
                .iter()
                .map(|n| (n.to_string(), LinkState::default()))
                .collect(),
            history: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Make every command matching `pred` fail from now on
    pub fn fail_when(&mut self, pred: impl FnMut(&TcCommand) -> bool + Send + 'static) {
        self.failures.push(Box::new(pred));
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Simulate the link going down and up: all qdiscs on it vanish
    pub fn flap(&mut self, dev: &str) {
        if let Some(link) = self.links.get_mut(dev) {
            link.clear_root();
            link.clear_ingress();
        }
    }

    /// Stash stale state on a device, as another tool might have left it
    pub fn inject_stale_class(&mut self, dev: &str, minor: u16, rate: &str) {
        if let Some(link) = self.links.get_mut(dev) {
            link.root_qdisc = true;
            link.classes.insert(minor, (1, rate.to_string()));
            link.filters.entry(minor).or_default().push(ModelFilter {
                mac: "00:00:00:00:00:00".to_string(),
                matches: MacMatch::Destination,
                minor,
            });
        }
    }

    pub fn history(&self) -> &[TcCommand] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn has_link(&self, dev: &str) -> bool {
        self.links.contains_key(dev)
    }

    pub fn has_root_qdisc(&self, dev: &str) -> bool {
        self.links.get(dev).is_some_and(|l| l.root_qdisc)
    }

    pub fn redirect_target(&self, dev: &str) -> Option<&str> {
        self.links.get(dev).and_then(|l| l.redirect.as_deref())
    }

    /// Class minors on `dev`, sorted
    pub fn classes(&self, dev: &str) -> Vec<u16> {
        self.links
            .get(dev)
            .map(|l| l.classes.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn class_rate(&self, dev: &str, minor: u16) -> Option<&str> {
        self.links
            .get(dev)
            .and_then(|l| l.classes.get(&minor))
            .map(|(_, rate)| rate.as_str())
    }

    pub fn has_leaf_qdisc(&self, dev: &str, minor: u16) -> bool {
        self.links
            .get(dev)
            .is_some_and(|l| l.leaf_qdiscs.contains(&minor))
    }

    /// All filters on `dev` as (prio, filter), sorted by prio
    pub fn filters(&self, dev: &str) -> Vec<(u16, ModelFilter)> {
        self.links
            .get(dev)
            .map(|l| {
                l.filters
                    .iter()
                    .flat_map(|(prio, fs)| fs.iter().map(|f| (*prio, f.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn link_mut(&mut self, dev: &str) -> Result<&mut LinkState> {
        self.links
            .get_mut(dev)
            .ok_or_else(|| anyhow!("Cannot find device \"{}\"", dev))
    }

    fn root_mut(&mut self, dev: &str) -> Result<&mut LinkState> {
        let link = self.link_mut(dev)?;
        if !link.root_qdisc {
            bail!("Cannot find specified qdisc on {}", dev);
        }
        Ok(link)
    }

    fn apply(&mut self, cmd: &TcCommand) -> Result<()> {
        match cmd {
            TcCommand::AddIfb { dev } => {
                if self.links.contains_key(dev) {
                    bail!("RTNETLINK answers: File exists");
                }
                self.links.insert(
                    dev.clone(),
                    LinkState {
                        ifb: true,
                        ..Default::default()
                    },
                );
            }
            TcCommand::LinkUp { dev } => {
                self.link_mut(dev)?;
            }
            TcCommand::DeleteLink { dev } => {
                if !self.links.get(dev).is_some_and(|l| l.ifb) {
                    bail!("Cannot find device \"{}\"", dev);
                }
                self.links.remove(dev);
                // Redirects pointing at a vanished device are dropped with it
                for link in self.links.values_mut() {
                    if link.redirect.as_deref() == Some(dev.as_str()) {
                        link.redirect = None;
                    }
                }
            }
            TcCommand::ReplaceRootQdisc { dev, .. } => {
                self.link_mut(dev)?.root_qdisc = true;
            }
            TcCommand::DeleteRootQdisc { dev } => {
                self.root_mut(dev)?.clear_root();
            }
            TcCommand::ReplaceIngressQdisc { dev } => {
                self.link_mut(dev)?.ingress_qdisc = true;
            }
            TcCommand::DeleteIngressQdisc { dev } => {
                let link = self.link_mut(dev)?;
                if !link.ingress_qdisc {
                    bail!("Cannot find specified qdisc on {}", dev);
                }
                link.clear_ingress();
            }
            TcCommand::AddRedirectFilter { dev, target } => {
                if !self.links.contains_key(target) {
                    bail!("Cannot find device \"{}\"", target);
                }
                let link = self.link_mut(dev)?;
                if !link.ingress_qdisc {
                    bail!("Cannot find specified qdisc on {}", dev);
                }
                link.redirect = Some(target.clone());
            }
            TcCommand::ReplaceClass {
                dev,
                parent,
                minor,
                rate,
            } => {
                let link = self.root_mut(dev)?;
                if *parent != 0 && !link.classes.contains_key(parent) {
                    bail!("Parent class 1:{:x} not found on {}", parent, dev);
                }
                link.classes.insert(*minor, (*parent, rate.clone()));
            }
            TcCommand::DeleteClass { dev, minor } => {
                let link = self.root_mut(dev)?;
                if link.classes.values().any(|(parent, _)| parent == minor) {
                    bail!("Device or resource busy");
                }
                if link.classes.remove(minor).is_none() {
                    bail!("Cannot find class 1:{:x} on {}", minor, dev);
                }
                link.leaf_qdiscs.remove(minor);
            }
            TcCommand::ReplaceLeafQdisc { dev, minor } => {
                let link = self.root_mut(dev)?;
                if !link.classes.contains_key(minor) {
                    bail!("Cannot find class 1:{:x} on {}", minor, dev);
                }
                link.leaf_qdiscs.insert(*minor);
            }
            TcCommand::AddMacFilter {
                dev,
                prio,
                mac,
                matches,
                minor,
            } => {
                let link = self.root_mut(dev)?;
                link.filters.entry(*prio).or_default().push(ModelFilter {
                    mac: mac.clone(),
                    matches: *matches,
                    minor: *minor,
                });
            }
            TcCommand::DeleteFilter { dev, prio } => {
                let link = self.root_mut(dev)?;
                if link.filters.remove(prio).is_none() {
                    bail!("Filter with prio {} not found on {}", prio, dev);
                }
            }
        }

        Ok(())
    }
}

impl RuleExecutor for KernelModel {
    fn name(&self) -> &'static str {
        "kernel_model"
    }

    fn execute(&mut self, cmd: &TcCommand) -> Result<()> {
        self.history.push(cmd.clone());

        if self.failures.iter_mut().any(|pred| pred(cmd)) {
            bail!("injected failure: {}", cmd);
        }

        self.apply(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(dev: &str, parent: u16, minor: u16) -> TcCommand {
        TcCommand::ReplaceClass {
            dev: dev.to_string(),
            parent,
            minor,
            rate: "1mbit".to_string(),
        }
    }

    #[test]
    fn test_class_requires_root_qdisc() {
        let mut model = KernelModel::with_links(&["lan0"]);
        assert!(model.execute(&class("lan0", 0, 1)).is_err());

        model
            .execute(&TcCommand::ReplaceRootQdisc {
                dev: "lan0".to_string(),
                default_minor: 2,
            })
            .unwrap();
        model.execute(&class("lan0", 0, 1)).unwrap();
        model.execute(&class("lan0", 1, 3)).unwrap();
        assert_eq!(model.classes("lan0"), vec![1, 3]);

        // Inner classes cannot be removed while they have children
        let del = |minor| TcCommand::DeleteClass {
            dev: "lan0".to_string(),
            minor,
        };
        assert!(model.execute(&del(1)).is_err());
        model.execute(&del(3)).unwrap();
        model.execute(&del(1)).unwrap();
        assert!(model.classes("lan0").is_empty());
    }

    #[test]
    fn test_flap_drops_qdiscs_but_keeps_link() {
        let mut model = KernelModel::with_links(&["lan0"]);
        model.inject_stale_class("lan0", 7, "3mbit");
        assert_eq!(model.classes("lan0"), vec![7]);

        model.flap("lan0");
        assert!(model.has_link("lan0"));
        assert!(!model.has_root_qdisc("lan0"));
        assert!(model.classes("lan0").is_empty());
    }

    #[test]
    fn test_injected_failures_are_recorded() {
        let mut model = KernelModel::with_links(&["lan0"]);
        model.fail_when(|cmd| matches!(cmd, TcCommand::AddIfb { .. }));

        let add = TcCommand::AddIfb {
            dev: "rl-lan0".to_string(),
        };
        assert!(model.execute(&add).is_err());
        assert!(!model.has_link("rl-lan0"));
        assert_eq!(model.history().len(), 1);

        model.clear_failures();
        model.execute(&add).unwrap();
        assert!(model.has_link("rl-lan0"));
    }
}
