// src/assemble/order.rs

//! Checkout order for the packages of one transaction
//!
//! Packages are ordered by their requirements within the transaction,
//! using the same dependency graph as resolution. The filesystem layout
//! package always goes first and file-override packages always go last,
//! whatever the dependency order says.

use crate::packages::PackageHeader;
use crate::resolver::DependencyGraph;
use std::collections::HashMap;

fn key(header: &PackageHeader) -> String {
    header.nevra.to_string()
}

/// Indices into `headers` in checkout order
pub fn install_order(
    headers: &[&PackageHeader],
    filesystem_package: &str,
    fileoverride_packages: &[String],
) -> Vec<usize> {
    let mut graph = DependencyGraph::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut providers: HashMap<&str, Vec<String>> = HashMap::new();

    for (i, h) in headers.iter().enumerate() {
        let k = key(h);
        graph.add_node(&k);
        index.insert(k.clone(), i);
        providers.entry(h.nevra.name.as_str()).or_default().push(k.clone());
        for p in &h.provides {
            providers.entry(p.as_str()).or_default().push(k.clone());
        }
    }
    for h in headers {
        let from = key(h);
        for req in &h.requires {
            for to in providers.get(req.as_str()).into_iter().flatten() {
                graph.add_edge(&from, to);
            }
        }
    }

    let (order, _) = graph.install_order();
    let mut order: Vec<usize> = order.iter().filter_map(|k| index.get(k).copied()).collect();

    let rank = |i: &usize| {
        let name = headers[*i].nevra.name.as_str();
        if name == filesystem_package {
            0
        } else if fileoverride_packages.iter().any(|p| p == name) {
            2
        } else {
            1
        }
    };
    // Stable, so the dependency order holds within each group
    order.sort_by_key(rank);
    order
}
