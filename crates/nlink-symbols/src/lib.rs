//! Component B — the three-tier symbol registry.
//!
//! A collection with add/lookup operations backing a higher-level
//! consumer, generalized into a name-keyed, refcounted table family.

use nlink_result::{NexusError, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Opaque address — NexusLink never dereferences this itself, it only
/// hands it back to whatever resolved it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Variable,
    Type,
    Constant,
    Macro,
    Struct,
    Enum,
    Union,
    Unknown,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Variable => "variable",
            SymbolKind::Type => "type",
            SymbolKind::Constant => "constant",
            SymbolKind::Macro => "macro",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Union => "union",
            SymbolKind::Unknown => "unknown",
        }
    }
}

/// The special owning-component id for truly process-global symbols.
pub const PROCESS_COMPONENT: &str = "process";

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub address: Address,
    pub kind: SymbolKind,
    pub component_id: String,
    pub refcount: u64,
}

/// A single table (one of global/imported/exported), keyed uniquely by
/// name. `insert`/`remove` preserve the invariant that a name appears at
/// most once; `get_mut` is what lets refcount updates mutate in place
/// without disturbing the rest of the entry.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        address: Address,
        kind: SymbolKind,
        component_id: &str,
    ) -> Result<()> {
        if self.symbols.contains_key(name) {
            return Err(NexusError::AlreadyPresent {
                name: name.to_string(),
            });
        }
        self.symbols.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                address,
                kind,
                component_id: component_id.to_string(),
                refcount: 1,
            },
        );
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.symbols.get_mut(name)
    }

    pub fn remove(&mut self, name: &str, force: bool) -> Result<Symbol> {
        let in_use = self
            .symbols
            .get(name)
            .map(|s| s.refcount > 0)
            .ok_or_else(|| NexusError::NotFound {
                name: name.to_string(),
            })?;
        if in_use && !force {
            return Err(NexusError::InUse {
                name: name.to_string(),
            });
        }
        Ok(self.symbols.remove(name).expect("presence checked above"))
    }

    pub fn count_used(&self) -> usize {
        self.symbols.values().filter(|s| s.refcount > 0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Exported,
    Imported,
    Global,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Exported => "exported",
            Tier::Imported => "imported",
            Tier::Global => "global",
        }
    }
}

#[derive(Debug, Clone)]
struct UsageEdge {
    using_component: String,
    owning_component: String,
    symbol_name: String,
}

/// The three-tier registry. Resolution order is exported -> imported ->
/// global, first hit wins.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    pub exported: SymbolTable,
    pub imported: SymbolTable,
    pub global: SymbolTable,
    usages: Vec<UsageEdge>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tiers(&self) -> [(Tier, &SymbolTable); 3] {
        [
            (Tier::Exported, &self.exported),
            (Tier::Imported, &self.imported),
            (Tier::Global, &self.global),
        ]
    }

    fn tier_table(&mut self, tier: Tier) -> &mut SymbolTable {
        match tier {
            Tier::Exported => &mut self.exported,
            Tier::Imported => &mut self.imported,
            Tier::Global => &mut self.global,
        }
    }

    /// The "unsafe" lookup: does not change refcount, does not validate kind.
    pub fn resolve(&self, name: &str) -> Option<Address> {
        self.tiers()
            .iter()
            .find_map(|(_, table)| table.find(name))
            .map(|s| s.address)
    }

    fn find_tier(&self, name: &str) -> Option<Tier> {
        self.tiers()
            .iter()
            .find(|(_, table)| table.find(name).is_some())
            .map(|(tier, _)| *tier)
    }

    /// Resolves, rejects kind mismatch, and records usage on success.
    pub fn lookup_with_type(
        &mut self,
        name: &str,
        expected_kind: SymbolKind,
        using_component: &str,
    ) -> Result<Address> {
        let tier = self.find_tier(name).ok_or_else(|| NexusError::NotFound {
            name: name.to_string(),
        })?;
        self.check_and_track(tier, name, expected_kind, using_component)
    }

    /// Same contract as `lookup_with_type`, but when a name exists in
    /// multiple tiers prefers the tier whose owning component id contains
    /// `context_tag` as a substring, falling back to the standard order.
    pub fn context_aware_resolve(
        &mut self,
        name: &str,
        context_tag: &str,
        expected_kind: SymbolKind,
        using_component: &str,
    ) -> Result<Address> {
        let tagged_tier = self
            .tiers()
            .iter()
            .find(|(_, table)| {
                table
                    .find(name)
                    .is_some_and(|s| s.component_id.contains(context_tag))
            })
            .map(|(tier, _)| *tier);

        let tier = match tagged_tier {
            Some(t) => t,
            None => self.find_tier(name).ok_or_else(|| NexusError::NotFound {
                name: name.to_string(),
            })?,
        };
        self.check_and_track(tier, name, expected_kind, using_component)
    }

    fn check_and_track(
        &mut self,
        tier: Tier,
        name: &str,
        expected_kind: SymbolKind,
        using_component: &str,
    ) -> Result<Address> {
        let (address, owning_component) = {
            let table = match tier {
                Tier::Exported => &self.exported,
                Tier::Imported => &self.imported,
                Tier::Global => &self.global,
            };
            let symbol = table.find(name).expect("tier already confirmed present");
            if symbol.kind != expected_kind {
                return Err(NexusError::KindMismatch {
                    name: name.to_string(),
                    expected: expected_kind.as_str().to_string(),
                    found: symbol.kind.as_str().to_string(),
                });
            }
            (symbol.address, symbol.component_id.clone())
        };
        self.track_usage_in_tier(tier, name, using_component, &owning_component);
        Ok(address)
    }

    /// Increments the refcount of the resolved symbol and records a usage
    /// edge for the DOT dump.
    pub fn track_usage(&mut self, name: &str, using_component: &str) -> Result<()> {
        let tier = self.find_tier(name).ok_or_else(|| NexusError::NotFound {
            name: name.to_string(),
        })?;
        let owning_component = {
            let table = match tier {
                Tier::Exported => &self.exported,
                Tier::Imported => &self.imported,
                Tier::Global => &self.global,
            };
            table
                .find(name)
                .expect("tier already confirmed present")
                .component_id
                .clone()
        };
        self.track_usage_in_tier(tier, name, using_component, &owning_component);
        Ok(())
    }

    fn track_usage_in_tier(
        &mut self,
        tier: Tier,
        name: &str,
        using_component: &str,
        owning_component: &str,
    ) {
        if let Some(symbol) = self.tier_table(tier).find_mut(name) {
            symbol.refcount += 1;
            debug!(
                tier = tier.as_str(),
                name, using_component, refcount = symbol.refcount, "symbol usage tracked"
            );
        }
        self.usages.push(UsageEdge {
            using_component: using_component.to_string(),
            owning_component: owning_component.to_string(),
            symbol_name: name.to_string(),
        });
    }

    /// Emits a Graphviz DOT directed graph: one node per `<component>::
    /// <symbol>` pair, one edge per tracked usage.
    pub fn dependency_graph_dump(&self) -> String {
        let mut out = String::new();
        writeln!(out, "digraph nexus_symbols {{").unwrap();
        for edge in &self.usages {
            let owner_node = format!("{}::{}", edge.owning_component, edge.symbol_name);
            let user_node = format!("{}::{}", edge.using_component, edge.symbol_name);
            writeln!(out, "  \"{user_node}\" -> \"{owner_node}\";").unwrap();
        }
        writeln!(out, "}}").unwrap();
        out
    }
}

/// Removal that enforces invariant (iii) ("a symbol with refcount > 0 is
/// in use and must not be removed") unless `force` is set — exposed at the
/// registry level so callers don't have to know which tier a name lives
/// in, matching `resolve`'s tier-agnostic contract.
pub fn remove_from_any_tier(registry: &mut SymbolRegistry, name: &str, force: bool) -> Result<()> {
    for tier in [Tier::Exported, Tier::Imported, Tier::Global] {
        let table = registry.tier_table(tier);
        if table.find(name).is_some() {
            table.remove(name, force)?;
            warn!(name, tier = tier.as_str(), "symbol removed from registry");
            return Ok(());
        }
    }
    Err(NexusError::NotFound {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: usize) -> Address {
        Address(n)
    }

    #[test]
    fn add_find_remove_round_trip() {
        let mut table = SymbolTable::new();
        table
            .add("foo", addr(1), SymbolKind::Function, "comp")
            .unwrap();
        assert!(table.find("foo").is_some());
        table.remove("foo", false).unwrap();
        assert!(table.find("foo").is_none());
    }

    #[test]
    fn duplicate_add_fails() {
        let mut table = SymbolTable::new();
        table
            .add("foo", addr(1), SymbolKind::Function, "comp")
            .unwrap();
        assert!(matches!(
            table.add("foo", addr(2), SymbolKind::Function, "comp"),
            Err(NexusError::AlreadyPresent { .. })
        ));
    }

    #[test]
    fn remove_missing_fails_not_found() {
        let mut table = SymbolTable::new();
        assert!(matches!(
            table.remove("nope", false),
            Err(NexusError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_in_use_fails_unless_forced() {
        let mut reg = SymbolRegistry::new();
        reg.exported
            .add("foo", addr(1), SymbolKind::Function, "comp")
            .unwrap();
        reg.track_usage("foo", "consumer").unwrap();
        assert!(matches!(
            remove_from_any_tier(&mut reg, "foo", false),
            Err(NexusError::InUse { .. })
        ));
        remove_from_any_tier(&mut reg, "foo", true).unwrap();
        assert!(reg.resolve("foo").is_none());
    }

    #[test]
    fn resolution_precedence_exported_imported_global() {
        let mut reg = SymbolRegistry::new();
        reg.exported
            .add("foo", addr(1), SymbolKind::Function, "a")
            .unwrap();
        reg.imported
            .add("foo", addr(2), SymbolKind::Function, "b")
            .unwrap();
        reg.global
            .add("foo", addr(3), SymbolKind::Function, "c")
            .unwrap();

        assert_eq!(reg.resolve("foo"), Some(addr(1)));
        reg.exported.remove("foo", true).unwrap();
        assert_eq!(reg.resolve("foo"), Some(addr(2)));
        reg.imported.remove("foo", true).unwrap();
        assert_eq!(reg.resolve("foo"), Some(addr(3)));
    }

    #[test]
    fn lookup_with_type_rejects_kind_mismatch() {
        let mut reg = SymbolRegistry::new();
        reg.exported
            .add("foo", addr(1), SymbolKind::Variable, "a")
            .unwrap();
        assert!(matches!(
            reg.lookup_with_type("foo", SymbolKind::Function, "consumer"),
            Err(NexusError::KindMismatch { .. })
        ));
    }

    #[test]
    fn lookup_with_type_tracks_usage_and_count_used() {
        let mut reg = SymbolRegistry::new();
        reg.exported
            .add("foo", addr(1), SymbolKind::Function, "a")
            .unwrap();
        assert_eq!(reg.exported.count_used(), 1); // add() itself sets refcount 1
        reg.lookup_with_type("foo", SymbolKind::Function, "consumer")
            .unwrap();
        let sym = reg.exported.find("foo").unwrap();
        assert_eq!(sym.refcount, 2);
    }

    #[test]
    fn context_aware_resolve_prefers_tagged_component() {
        let mut reg = SymbolRegistry::new();
        reg.imported
            .add("foo", addr(1), SymbolKind::Function, "plugin-net")
            .unwrap();
        reg.global
            .add("foo", addr(2), SymbolKind::Function, "plugin-io")
            .unwrap();
        let resolved = reg
            .context_aware_resolve("foo", "io", SymbolKind::Function, "consumer")
            .unwrap();
        assert_eq!(resolved, addr(2));
    }

    #[test]
    fn context_aware_resolve_falls_back_to_standard_order() {
        let mut reg = SymbolRegistry::new();
        reg.imported
            .add("foo", addr(1), SymbolKind::Function, "plugin-net")
            .unwrap();
        let resolved = reg
            .context_aware_resolve("foo", "nonexistent-tag", SymbolKind::Function, "consumer")
            .unwrap();
        assert_eq!(resolved, addr(1));
    }

    #[test]
    fn dot_dump_has_one_edge_per_usage() {
        let mut reg = SymbolRegistry::new();
        reg.exported
            .add("foo", addr(1), SymbolKind::Function, "owner")
            .unwrap();
        reg.track_usage("foo", "consumer").unwrap();
        let dot = reg.dependency_graph_dump();
        assert!(dot.starts_with("digraph nexus_symbols {"));
        assert!(dot.contains("\"consumer::foo\" -> \"owner::foo\""));
    }
}
