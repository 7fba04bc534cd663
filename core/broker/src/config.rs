//! Broker configuration: visibility/forwarding rules plus the runtime
//! settings derived from the command line.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Default location of the rules file.
pub const DEFAULT_RULES_FILE: &str = "/etc/servicebroker.cfg";

/// Interface visibility and forwarding rules.
///
/// The file is INI-like: `[LOCAL]`, `[GLOBAL]` and `[FORWARD]` sections
/// list one interface name per line, `#` starts a comment. A non-empty
/// `[GLOBAL]` section inverts the local rule: everything not listed there
/// is local. `[FORWARD]` governs what a tree-mode broker advertises
/// upstream; a single `*` forwards everything.
#[derive(Debug, Default, Clone)]
pub struct Rules {
    local: BTreeSet<String>,
    global: BTreeSet<String>,
    forward: BTreeSet<String>,
    tree_mode: bool,
}

impl Rules {
    /// Loads rules from a file. A missing default file is fine; a missing
    /// explicitly named file is reported and yields empty rules.
    pub fn load(path: Option<&Path>) -> Self {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_RULES_FILE), false),
        };

        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("loading config file {}", path.display());
                Self::parse(&text)
            }
            Err(err) => {
                if explicit {
                    error!("error loading config file '{}': {err}", path.display());
                }
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        #[derive(PartialEq)]
        enum Section {
            Ignore,
            Local,
            Global,
            Forward,
        }

        let mut rules = Rules::default();
        let mut section = Section::Ignore;

        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = match name {
                    "LOCAL" => Section::Local,
                    "GLOBAL" => Section::Global,
                    "FORWARD" => Section::Forward,
                    _ => Section::Ignore,
                };
                continue;
            }

            match section {
                Section::Local => {
                    debug!("   local service: {line}");
                    rules.local.insert(line.to_owned());
                }
                Section::Global => {
                    debug!("   global service: {line}");
                    rules.global.insert(line.to_owned());
                }
                Section::Forward => {
                    debug!("   forward service: {line}");
                    rules.forward.insert(line.to_owned());
                }
                Section::Ignore => {}
            }
        }

        rules
    }

    pub fn set_tree_mode(&mut self, tree_mode: bool) {
        self.tree_mode = tree_mode;
    }

    pub fn is_tree_mode(&self) -> bool {
        self.tree_mode
    }

    /// Local services are invisible to remote brokers and never forwarded.
    pub fn is_local_service(&self, name: &str) -> bool {
        if !self.global.is_empty() {
            !self.global.contains(name)
        } else {
            self.local.contains(name)
        }
    }

    /// Whether a tree-mode broker advertises this service upstream; the
    /// `_tcp` transport suffix is ignored for the lookup.
    pub fn forward_service(&self, name: &str) -> bool {
        if !self.tree_mode {
            return true;
        }
        if self.forward.len() == 1 && self.forward.contains("*") {
            return true;
        }
        let plain = name.strip_suffix("_tcp").filter(|p| !p.is_empty()).unwrap_or(name);
        self.forward.contains(plain)
    }
}

/// Settings the dispatcher needs at runtime, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Extended id stamped into every locally minted party id.
    pub extended_id: u32,
    pub tree_mode: bool,
    pub use_cache: bool,
    pub async_attach: bool,
    /// True when no upstream master is configured.
    pub is_master: bool,
}

impl Settings {
    /// Applies the historic id rules: an explicit tree id wins, a broker
    /// without upstream uses the classic slave id, a classic slave uses 0
    /// and receives its effective id from the master at forward time.
    pub fn resolve(tree_id: Option<u32>, has_master: bool) -> Self {
        let is_master = !has_master;
        let extended_id = match tree_id {
            Some(id) => id,
            None if is_master => switchboard_types::CLASSIC_SLAVE_EXTENDED_ID,
            None => 0,
        };
        Self {
            extended_id,
            tree_mode: tree_id.is_some(),
            use_cache: false,
            async_attach: false,
            is_master,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
# visibility rules
[LOCAL]
secret.Svc      # node-only
[FORWARD]
public.Svc
media.Player
";

    #[test]
    fn sections_and_comments() {
        let mut rules = Rules::parse(SAMPLE);
        rules.set_tree_mode(true);

        assert!(rules.is_local_service("secret.Svc"));
        assert!(!rules.is_local_service("public.Svc"));
        assert!(rules.forward_service("public.Svc"));
        assert!(!rules.forward_service("secret.Svc"));
    }

    #[test]
    fn global_section_suppresses_local() {
        let rules = Rules::parse("[LOCAL]\na\n[GLOBAL]\nb\n");
        // With a non-empty GLOBAL section, everything not global is local.
        assert!(rules.is_local_service("a"));
        assert!(rules.is_local_service("c"));
        assert!(!rules.is_local_service("b"));
    }

    #[test]
    fn forward_wildcard_and_tcp_suffix() {
        let mut rules = Rules::parse("[FORWARD]\n*\n");
        rules.set_tree_mode(true);
        assert!(rules.forward_service("anything"));

        let mut rules = Rules::parse("[FORWARD]\nmedia.Player\n");
        rules.set_tree_mode(true);
        assert!(rules.forward_service("media.Player_tcp"));
        assert!(!rules.forward_service("other_tcp"));
    }

    #[test]
    fn outside_tree_mode_everything_forwards() {
        let rules = Rules::parse("[FORWARD]\nonly.This\n");
        assert!(rules.forward_service("anything.Else"));
    }

    #[test]
    fn id_resolution() {
        let master = Settings::resolve(None, false);
        assert_eq!(master.extended_id, 1000);
        assert!(master.is_master);

        let classic_slave = Settings::resolve(None, true);
        assert_eq!(classic_slave.extended_id, 0);
        assert!(!classic_slave.is_master);

        let tree = Settings::resolve(Some(7), true);
        assert_eq!(tree.extended_id, 7);
        assert!(tree.tree_mode);
    }
}
