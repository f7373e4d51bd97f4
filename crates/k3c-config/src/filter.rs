//! Node filter grammar and resolution.
//!
//! Filters select a subset of the expanded node list:
//! `(all|server|agent|loadbalancer)(:<index>|:*)?`, several filters joined
//! with `;`. `server:0` is the first server, `agent:*` every agent,
//! `loadbalancer` the LB. Resolution preserves node order and deduplicates.

use std::sync::OnceLock;

use k3c_types::{NodeSpec, Role};
use regex::Regex;

use crate::error::{ConfigError, Result};

/// Role selector of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterRole {
    All,
    Server,
    Agent,
    LoadBalancer,
}

/// Index selector of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterIndex {
    All,
    One(usize),
}

/// A parsed node filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFilter {
    role: FilterRole,
    index: FilterIndex,
}

fn filter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(all|server|agent|loadbalancer)(?::(\*|\d+))?$").expect("static regex")
    })
}

impl NodeFilter {
    /// Parses a single filter term.
    pub fn parse(term: &str) -> Result<Self> {
        let caps = filter_regex()
            .captures(term.trim())
            .ok_or_else(|| ConfigError::InvalidNodeFilter(term.to_string()))?;

        let role = match &caps[1] {
            "all" => FilterRole::All,
            "server" => FilterRole::Server,
            "agent" => FilterRole::Agent,
            "loadbalancer" => FilterRole::LoadBalancer,
            _ => unreachable!("anchored regex"),
        };

        let index = match caps.get(2).map(|m| m.as_str()) {
            None | Some("*") => FilterIndex::All,
            Some(digits) => FilterIndex::One(
                digits
                    .parse()
                    .map_err(|_| ConfigError::InvalidNodeFilter(term.to_string()))?,
            ),
        };

        // an indexed `all` or `loadbalancer` filter is meaningless
        if matches!(index, FilterIndex::One(_))
            && matches!(role, FilterRole::All | FilterRole::LoadBalancer)
        {
            return Err(ConfigError::InvalidNodeFilter(term.to_string()));
        }

        Ok(Self { role, index })
    }

    fn matches_role(&self, role: Role) -> bool {
        match self.role {
            FilterRole::All => role != Role::Tools,
            FilterRole::Server => role == Role::Server,
            FilterRole::Agent => role == Role::Agent,
            FilterRole::LoadBalancer => role == Role::LoadBalancer,
        }
    }
}

/// Parses a `;`-separated filter list.
pub fn parse_filters(raw: &[String]) -> Result<Vec<NodeFilter>> {
    let mut filters = Vec::new();
    for entry in raw {
        for term in entry.split(';').filter(|t| !t.trim().is_empty()) {
            filters.push(NodeFilter::parse(term)?);
        }
    }
    Ok(filters)
}

/// Resolves filters against the expanded node list.
///
/// Returns indices into `nodes` in node order, deduplicated. An empty
/// filter list selects every node. Out-of-range indices are
/// [`ConfigError::InvalidNodeFilter`]; a filter set matching nothing is
/// [`ConfigError::FilterNoMatch`].
pub fn resolve(raw: &[String], nodes: &[NodeSpec]) -> Result<Vec<usize>> {
    let filters = if raw.is_empty() {
        vec![NodeFilter {
            role: FilterRole::All,
            index: FilterIndex::All,
        }]
    } else {
        parse_filters(raw)?
    };

    let mut selected = vec![false; nodes.len()];
    for filter in &filters {
        let role_matches: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| filter.matches_role(n.role))
            .map(|(i, _)| i)
            .collect();

        match filter.index {
            FilterIndex::All => {
                for i in role_matches {
                    selected[i] = true;
                }
            }
            FilterIndex::One(nth) => {
                let i = role_matches.get(nth).copied().ok_or_else(|| {
                    ConfigError::InvalidNodeFilter(format!(
                        "{}:{nth} (only {} such nodes)",
                        role_name(filter.role),
                        role_matches.len()
                    ))
                })?;
                selected[i] = true;
            }
        }
    }

    let indices: Vec<usize> = selected
        .iter()
        .enumerate()
        .filter_map(|(i, sel)| sel.then_some(i))
        .collect();

    if indices.is_empty() {
        return Err(ConfigError::FilterNoMatch(raw.join(";")));
    }
    Ok(indices)
}

/// Resolves filters that must select exactly one node.
pub fn resolve_single(raw: &[String], nodes: &[NodeSpec]) -> Result<usize> {
    let indices = resolve(raw, nodes)?;
    match indices.as_slice() {
        [one] => Ok(*one),
        _ => Err(ConfigError::FilterAmbiguous(raw.join(";"))),
    }
}

fn role_name(role: FilterRole) -> &'static str {
    match role {
        FilterRole::All => "all",
        FilterRole::Server => "server",
        FilterRole::Agent => "agent",
        FilterRole::LoadBalancer => "loadbalancer",
    }
}
